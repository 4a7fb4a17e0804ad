//! Pre-key bundles and the directory that serves them.
//!
//! The directory itself is a collaborator outside this crate. The session layer only needs `KeyBundleService::fetch_bundle` to start a handshake and `fetch_identity_key` to check who started one; `MemoryDirectory` is an in-process implementation that serves what peers actually published.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::crypto::fingerprint;
use crate::error::DirectoryError;

/// PreKeyBundle is what a peer's directory entry yields for one handshake.
///
/// Fields are raw byte buffers as received; lengths are checked when the handshake uses them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PreKeyBundle {
    pub identity_key: Vec<u8>,
    pub signed_pre_key: Vec<u8>,
    pub signed_pre_key_signature: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_pre_key: Option<Vec<u8>>,
}

impl PreKeyBundle {
    pub fn has_one_time_pre_key(&self) -> bool {
        self.one_time_pre_key.is_some()
    }
}

/// PublishedKeys is the upload a user makes to the directory: identity, signed pre-key and a batch of one-time pre-keys.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PublishedKeys {
    pub identity_key: Vec<u8>,
    pub signed_pre_key: Vec<u8>,
    pub signed_pre_key_signature: Vec<u8>,
    pub one_time_pre_keys: Vec<Vec<u8>>,
}

/// KeyBundleService resolves a peer id to a pre-key bundle.
#[async_trait]
pub trait KeyBundleService: Send + Sync {
    async fn fetch_bundle(&self, peer_id: &str) -> Result<PreKeyBundle, DirectoryError>;

    /// fetch_identity_key returns only the identity key listed for `peer_id`. No one-time pre-key is handed out.
    async fn fetch_identity_key(&self, peer_id: &str) -> Result<Vec<u8>, DirectoryError>;
}

struct DirectoryEntry {
    identity_key: Vec<u8>,
    signed_pre_key: Vec<u8>,
    signed_pre_key_signature: Vec<u8>,
    one_time_pre_keys: VecDeque<Vec<u8>>,
}

/// MemoryDirectory keeps published keys in memory and hands out each one-time pre-key at most once.
#[derive(Default)]
pub struct MemoryDirectory {
    entries: Mutex<HashMap<String, DirectoryEntry>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// publish replaces the identity and signed pre-key of `peer_id` and appends the one-time pre-keys
    pub fn publish(&self, peer_id: &str, keys: PublishedKeys) -> Result<(), DirectoryError> {
        let mut entries = self.lock()?;
        let count = keys.one_time_pre_keys.len();
        match entries.get_mut(peer_id) {
            Some(entry) if entry.identity_key == keys.identity_key => {
                entry.signed_pre_key = keys.signed_pre_key;
                entry.signed_pre_key_signature = keys.signed_pre_key_signature;
                entry.one_time_pre_keys.extend(keys.one_time_pre_keys);
            }
            _ => {
                // A new identity invalidates every pre-key published under the old one
                entries.insert(
                    peer_id.to_string(),
                    DirectoryEntry {
                        identity_key: keys.identity_key,
                        signed_pre_key: keys.signed_pre_key,
                        signed_pre_key_signature: keys.signed_pre_key_signature,
                        one_time_pre_keys: keys.one_time_pre_keys.into(),
                    },
                );
            }
        }
        debug!("directory: {peer_id} published {count} one-time pre-keys");
        Ok(())
    }

    /// remaining_one_time_pre_keys is how many one-time pre-keys are left for `peer_id`
    pub fn remaining_one_time_pre_keys(&self, peer_id: &str) -> Result<usize, DirectoryError> {
        let entries = self.lock()?;
        entries
            .get(peer_id)
            .map(|entry| entry.one_time_pre_keys.len())
            .ok_or_else(|| DirectoryError::PeerNotFound(peer_id.to_string()))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, DirectoryEntry>>, DirectoryError> {
        self.entries
            .lock()
            .map_err(|_| DirectoryError::Network("directory lock poisoned".into()))
    }
}

#[async_trait]
impl KeyBundleService for MemoryDirectory {
    async fn fetch_bundle(&self, peer_id: &str) -> Result<PreKeyBundle, DirectoryError> {
        let mut entries = self.lock()?;
        let entry = entries
            .get_mut(peer_id)
            .ok_or_else(|| DirectoryError::PeerNotFound(peer_id.to_string()))?;
        let one_time_pre_key = entry.one_time_pre_keys.pop_front();
        debug!(
            "directory: serving bundle for {peer_id} (identity {}, one-time pre-key: {})",
            fingerprint(&entry.identity_key),
            one_time_pre_key.is_some()
        );
        Ok(PreKeyBundle {
            identity_key: entry.identity_key.clone(),
            signed_pre_key: entry.signed_pre_key.clone(),
            signed_pre_key_signature: entry.signed_pre_key_signature.clone(),
            one_time_pre_key,
        })
    }

    async fn fetch_identity_key(&self, peer_id: &str) -> Result<Vec<u8>, DirectoryError> {
        let entries = self.lock()?;
        entries
            .get(peer_id)
            .map(|entry| entry.identity_key.clone())
            .ok_or_else(|| DirectoryError::PeerNotFound(peer_id.to_string()))
    }
}

/* ------------------------------------------------------------------------- */

// TESTS

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(identity: u8, one_time: &[u8]) -> PublishedKeys {
        PublishedKeys {
            identity_key: vec![identity; 32],
            signed_pre_key: vec![2; 32],
            signed_pre_key_signature: vec![3; 64],
            one_time_pre_keys: one_time.iter().map(|b| vec![*b; 32]).collect(),
        }
    }

    #[tokio::test]
    async fn unknown_peer_is_not_found() {
        let directory = MemoryDirectory::new();
        assert_eq!(
            directory.fetch_bundle("nobody").await.unwrap_err(),
            DirectoryError::PeerNotFound("nobody".into())
        );
    }

    #[tokio::test]
    async fn one_time_pre_keys_are_served_once() {
        let directory = MemoryDirectory::new();
        directory.publish("bob", keys(1, &[10, 11])).unwrap();

        let first = directory.fetch_bundle("bob").await.unwrap();
        let second = directory.fetch_bundle("bob").await.unwrap();
        let third = directory.fetch_bundle("bob").await.unwrap();
        assert_eq!(first.one_time_pre_key, Some(vec![10; 32]));
        assert_eq!(second.one_time_pre_key, Some(vec![11; 32]));
        assert!(!third.has_one_time_pre_key());
        assert_eq!(third.identity_key, vec![1; 32]);
        assert_eq!(directory.remaining_one_time_pre_keys("bob").unwrap(), 0);
    }

    #[tokio::test]
    async fn identity_lookup_leaves_one_time_pre_keys_alone() {
        let directory = MemoryDirectory::new();
        directory.publish("bob", keys(1, &[10])).unwrap();
        assert_eq!(directory.fetch_identity_key("bob").await.unwrap(), vec![1; 32]);
        assert_eq!(directory.remaining_one_time_pre_keys("bob").unwrap(), 1);
        assert!(matches!(
            directory.fetch_identity_key("carol").await,
            Err(DirectoryError::PeerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn republishing_appends_or_replaces() {
        let directory = MemoryDirectory::new();
        directory.publish("bob", keys(1, &[10])).unwrap();
        directory.publish("bob", keys(1, &[11])).unwrap();
        assert_eq!(directory.remaining_one_time_pre_keys("bob").unwrap(), 2);

        directory.publish("bob", keys(9, &[12])).unwrap();
        assert_eq!(directory.remaining_one_time_pre_keys("bob").unwrap(), 1);
        let bundle = directory.fetch_bundle("bob").await.unwrap();
        assert_eq!(bundle.identity_key, vec![9; 32]);
        assert_eq!(bundle.one_time_pre_key, Some(vec![12; 32]));
    }

    #[test]
    fn bundle_serde_omits_missing_one_time_pre_key() {
        let bundle = PreKeyBundle {
            identity_key: vec![1],
            signed_pre_key: vec![2],
            signed_pre_key_signature: vec![3],
            one_time_pre_key: None,
        };
        let text = toml::to_string(&bundle).unwrap();
        assert!(!text.contains("one_time_pre_key"));
        let parsed: PreKeyBundle = toml::from_str(&text).unwrap();
        assert_eq!(parsed, bundle);
    }
}
