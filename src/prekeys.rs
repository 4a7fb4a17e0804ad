//! Local pre-keys: the signed pre-key and the one-time pre-keys whose public halves are published to the directory.
//!
//! The secrets stay in the `prekeys` table. A one-time pre-key secret is deleted in the same transaction that stores the session built from it (`SessionStore::save_session_consuming_prekey`).

use chrono::Utc;
use log::{debug, info};
use rusqlite::{params, OptionalExtension};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::bundle::PublishedKeys;
use crate::crypto::{fingerprint, random_bytes, KEY_LENGTH};
use crate::error::StoreError;
use crate::identity::IdentityKeyPair;
use crate::store::{key_from_blob, to_millis, Database};

/// SIGNED_KIND tags the signed pre-key row
const SIGNED_KIND: &str = "signed";
/// ONE_TIME_KIND tags one-time pre-key rows
const ONE_TIME_KIND: &str = "one_time";

/// SignedPreKey is the public half of the signed pre-key and the identity signature over it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPreKey {
    pub public_key: [u8; KEY_LENGTH],
    pub signature: Vec<u8>,
}

fn generate_keypair() -> (StaticSecret, [u8; KEY_LENGTH]) {
    let secret = StaticSecret::from(random_bytes::<KEY_LENGTH>());
    let public = PublicKey::from(&secret).to_bytes();
    (secret, public)
}

/// PreKeyStore manages the local pre-key secrets.
#[derive(Clone)]
pub struct PreKeyStore {
    db: Database,
}

impl PreKeyStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// ensure_signed_prekey returns the signed pre-key, creating and signing one with `identity` if none exists
    pub async fn ensure_signed_prekey(&self, identity: &IdentityKeyPair) -> Result<SignedPreKey, StoreError> {
        let identity = identity.clone();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let existing = tx
                    .query_row(
                        "SELECT public_key, signature FROM prekeys WHERE kind = ?1",
                        params![SIGNED_KIND],
                        |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Option<Vec<u8>>>(1)?)),
                    )
                    .optional()?;
                let signed = match existing {
                    Some((public_key, Some(signature))) => SignedPreKey {
                        public_key: key_from_blob(&public_key, "signed pre-key")?,
                        signature,
                    },
                    Some((_, None)) => return Err(StoreError::Corrupt("signed pre-key has no signature".into())),
                    None => {
                        let (secret, public_key) = generate_keypair();
                        let signature = identity.sign(&public_key).to_vec();
                        let private_key = Zeroizing::new(secret.to_bytes());
                        tx.execute(
                            "INSERT INTO prekeys (public_key, private_key, kind, signature, created_at)
                             VALUES (?1, ?2, ?3, ?4, ?5)",
                            params![
                                &public_key[..],
                                &private_key[..],
                                SIGNED_KIND,
                                signature,
                                to_millis(Utc::now())
                            ],
                        )?;
                        info!("generated signed pre-key {}", fingerprint(&public_key));
                        SignedPreKey { public_key, signature }
                    }
                };
                tx.commit()?;
                Ok(signed)
            })
            .await
    }

    /// generate_one_time_prekeys stores `count` fresh one-time pre-keys and returns their public halves
    pub async fn generate_one_time_prekeys(&self, count: usize) -> Result<Vec<[u8; KEY_LENGTH]>, StoreError> {
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut published = Vec::with_capacity(count);
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO prekeys (public_key, private_key, kind, signature, created_at)
                         VALUES (?1, ?2, ?3, NULL, ?4)",
                    )?;
                    let now = to_millis(Utc::now());
                    for _ in 0..count {
                        let (secret, public_key) = generate_keypair();
                        let private_key = Zeroizing::new(secret.to_bytes());
                        stmt.execute(params![&public_key[..], &private_key[..], ONE_TIME_KIND, now])?;
                        published.push(public_key);
                    }
                }
                tx.commit()?;
                debug!("generated {count} one-time pre-keys");
                Ok(published)
            })
            .await
    }

    /// one_time_prekey_count is the number of unconsumed one-time pre-keys
    pub async fn one_time_prekey_count(&self) -> Result<usize, StoreError> {
        self.db
            .call(|conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM prekeys WHERE kind = ?1",
                    params![ONE_TIME_KIND],
                    |row| row.get(0),
                )?;
                Ok(count as usize)
            })
            .await
    }

    /// publish assembles the directory upload: identity, signed pre-key, and `count` new one-time pre-keys
    pub async fn publish(&self, identity: &IdentityKeyPair, count: usize) -> Result<PublishedKeys, StoreError> {
        let signed = self.ensure_signed_prekey(identity).await?;
        let one_time = self.generate_one_time_prekeys(count).await?;
        Ok(PublishedKeys {
            identity_key: identity.public_key().to_vec(),
            signed_pre_key: signed.public_key.to_vec(),
            signed_pre_key_signature: signed.signature,
            one_time_pre_keys: one_time.iter().map(|key| key.to_vec()).collect(),
        })
    }

    /// signed_prekey_secret is the signed pre-key secret with its public key, if one was created
    pub(crate) async fn signed_prekey_secret(&self) -> Result<Option<(StaticSecret, [u8; KEY_LENGTH])>, StoreError> {
        self.db
            .call(|conn| {
                let row = conn
                    .query_row(
                        "SELECT public_key, private_key FROM prekeys WHERE kind = ?1",
                        params![SIGNED_KIND],
                        |row| Ok((row.get::<_, Vec<u8>>(0)?, Zeroizing::new(row.get::<_, Vec<u8>>(1)?))),
                    )
                    .optional()?;
                match row {
                    Some((public_key, private_key)) => Ok(Some((
                        StaticSecret::from(key_from_blob(&private_key, "signed pre-key secret")?),
                        key_from_blob(&public_key, "signed pre-key")?,
                    ))),
                    None => Ok(None),
                }
            })
            .await
    }

    /// one_time_prekey_secret looks up an unconsumed one-time pre-key by its public half
    pub(crate) async fn one_time_prekey_secret(
        &self,
        public_key: &[u8; KEY_LENGTH],
    ) -> Result<Option<StaticSecret>, StoreError> {
        let public_key = *public_key;
        self.db
            .call(move |conn| {
                let private_key = conn
                    .query_row(
                        "SELECT private_key FROM prekeys WHERE public_key = ?1 AND kind = ?2",
                        params![&public_key[..], ONE_TIME_KIND],
                        |row| Ok(Zeroizing::new(row.get::<_, Vec<u8>>(0)?)),
                    )
                    .optional()?;
                match private_key {
                    Some(blob) => Ok(Some(StaticSecret::from(key_from_blob(&blob, "one-time pre-key secret")?))),
                    None => Ok(None),
                }
            })
            .await
    }
}

/* ------------------------------------------------------------------------- */

// TESTS

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::verify_signature;
    use crate::ratchet::{ChainKey, RootKey, SessionState};
    use crate::store::SessionStore;

    async fn stores() -> (PreKeyStore, SessionStore) {
        let db = Database::open_in_memory().await.unwrap();
        (PreKeyStore::new(db.clone()), SessionStore::new(db))
    }

    #[tokio::test]
    async fn signed_prekey_is_created_once_and_verifies() {
        let (store, _) = stores().await;
        let identity = IdentityKeyPair::generate();
        let first = store.ensure_signed_prekey(&identity).await.unwrap();
        let second = store.ensure_signed_prekey(&identity).await.unwrap();
        assert_eq!(first, second);
        assert!(verify_signature(&identity.public_key(), &first.public_key, &first.signature).is_ok());

        let (secret, public_key) = store.signed_prekey_secret().await.unwrap().unwrap();
        assert_eq!(public_key, first.public_key);
        assert_eq!(PublicKey::from(&secret).to_bytes(), first.public_key);
    }

    #[tokio::test]
    async fn no_signed_prekey_until_requested() {
        let (store, _) = stores().await;
        assert!(store.signed_prekey_secret().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn publish_exports_public_halves() {
        let (store, _) = stores().await;
        let identity = IdentityKeyPair::generate();
        let published = store.publish(&identity, 5).await.unwrap();
        assert_eq!(published.identity_key, identity.public_key().to_vec());
        assert_eq!(published.one_time_pre_keys.len(), 5);
        assert_eq!(store.one_time_prekey_count().await.unwrap(), 5);

        for key in &published.one_time_pre_keys {
            let public_key = key_from_blob(key, "test").unwrap();
            let secret = store.one_time_prekey_secret(&public_key).await.unwrap().unwrap();
            assert_eq!(PublicKey::from(&secret).to_bytes(), public_key);
        }
        assert!(store.one_time_prekey_secret(&[0u8; 32]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn consumed_prekey_secret_is_gone() {
        let (store, sessions) = stores().await;
        let public_key = store.generate_one_time_prekeys(1).await.unwrap()[0];
        let session = SessionState::new(
            "alice",
            RootKey::from_bytes([1u8; 32]),
            ChainKey::from_bytes([2u8; 32]),
            ChainKey::from_bytes([3u8; 32]),
            vec![4u8; 32],
            None,
        );
        sessions.save_session_consuming_prekey(&session, public_key).await.unwrap();
        assert!(store.one_time_prekey_secret(&public_key).await.unwrap().is_none());
        assert_eq!(store.one_time_prekey_count().await.unwrap(), 0);
    }
}
