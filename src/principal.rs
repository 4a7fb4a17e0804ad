//! The Principal is the local participant: it owns the identity, the stores and the directory handle, and turns plaintext into wire bytes and back for any number of peers.
//!
//! Every operation on one peer runs under that peer's lock, so the load, ratchet step and save of a session never interleave with another operation on the same session. Different peers proceed concurrently. `logout` takes the gate exclusively and waits for every per-peer operation to finish.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::{OwnedMutexGuard, RwLock, RwLockReadGuard};

use crate::bundle::{KeyBundleService, PublishedKeys};
use crate::config::SessionConfig;
use crate::crypto::{fingerprint, open, seal};
use crate::error::{Error, StoreError};
use crate::handshake::{self, HandshakeHeader};
use crate::identity::{IdentityKeyPair, IdentityStore};
use crate::messages::EncryptedMessage;
use crate::prekeys::PreKeyStore;
use crate::ratchet::{RatchetEngine, SessionState};
use crate::store::{Database, SessionStore};

type PeerLock = Arc<tokio::sync::Mutex<()>>;

/// PeerGuard holds the shared gate and one peer's lock. Dropping it forgets the lock once nobody else holds or waits on it.
struct PeerGuard<'a> {
    locks: &'a Mutex<HashMap<String, PeerLock>>,
    peer_id: String,
    held: Option<OwnedMutexGuard<()>>,
    _gate: RwLockReadGuard<'a, ()>,
}

impl Drop for PeerGuard<'_> {
    fn drop(&mut self) {
        drop(self.held.take());
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(&self.peer_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&self.peer_id);
        }
    }
}

/// Principal is the upward API of the session layer.
pub struct Principal {
    db: Database,
    identity: IdentityKeyPair,
    sessions: SessionStore,
    prekeys: PreKeyStore,
    directory: Arc<dyn KeyBundleService>,
    engine: RatchetEngine,
    bundle_fetch_timeout: Duration,
    prekey_batch: usize,
    gate: RwLock<()>,
    locks: Mutex<HashMap<String, PeerLock>>,
}

impl Principal {
    /// open opens the configured database and loads the identity, creating it on first use
    pub async fn open(config: &SessionConfig, directory: Arc<dyn KeyBundleService>) -> Result<Self, Error> {
        let db = open_database(config).await?;
        let identity = IdentityStore::new(db.clone()).ensure_identity_key().await?;
        Ok(Self::assemble(config, db, identity, directory))
    }

    /// open_existing is `open` for a user that must already be provisioned. Fails with IdentityMissing otherwise.
    pub async fn open_existing(config: &SessionConfig, directory: Arc<dyn KeyBundleService>) -> Result<Self, Error> {
        let db = open_database(config).await?;
        let identity = match IdentityStore::new(db.clone()).get_identity_key().await? {
            Some(identity) => identity,
            None => {
                db.close().await?;
                return Err(Error::IdentityMissing);
            }
        };
        Ok(Self::assemble(config, db, identity, directory))
    }

    fn assemble(
        config: &SessionConfig,
        db: Database,
        identity: IdentityKeyPair,
        directory: Arc<dyn KeyBundleService>,
    ) -> Self {
        info!("principal ready with identity {}", identity.fingerprint());
        Self {
            sessions: SessionStore::new(db.clone()),
            prekeys: PreKeyStore::new(db.clone()),
            db,
            identity,
            directory,
            engine: config.ratchet_engine(),
            bundle_fetch_timeout: config.bundle_fetch_timeout(),
            prekey_batch: config.one_time_prekey_batch,
            gate: RwLock::new(()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }

    /// public_identity_key is the base64 public identity key
    pub fn public_identity_key(&self) -> String {
        BASE64.encode(self.identity.public_key())
    }

    /// publish_keys prepares the directory upload, with a fresh batch of one-time pre-keys
    pub async fn publish_keys(&self) -> Result<PublishedKeys, Error> {
        let published = self.prekeys.publish(&self.identity, self.prekey_batch).await?;
        info!(
            "prepared {} one-time pre-keys for publication",
            published.one_time_pre_keys.len()
        );
        Ok(published)
    }

    /// session returns the stored session with `peer_id`, if any
    pub async fn session(&self, peer_id: &str) -> Result<Option<SessionState>, Error> {
        Ok(self.sessions.get_session(peer_id).await?)
    }

    /// recent_sessions lists peers by most recent activity
    pub async fn recent_sessions(&self, limit: usize) -> Result<Vec<(String, DateTime<Utc>)>, Error> {
        Ok(self.sessions.recent_sessions(limit).await?)
    }

    /// ensure_session returns the session with `peer_id`, running the handshake and saving its result if there is none
    pub async fn ensure_session(&self, peer_id: &str) -> Result<SessionState, Error> {
        let _guard = self.lock_peer(peer_id).await;
        if let Some(session) = self.sessions.get_session(peer_id).await? {
            return Ok(session);
        }
        let session = self.initiate(peer_id).await?;
        self.sessions.save_session(&session).await?;
        Ok(session)
    }

    /// encrypt_for_peer seals `plaintext` with the next sending key and returns the serialized message
    pub async fn encrypt_for_peer(&self, peer_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let _guard = self.lock_peer(peer_id).await;
        let session = match self.sessions.get_session(peer_id).await? {
            Some(session) => session,
            None => self.initiate(peer_id).await?,
        };

        let counter = session.sending_counter();
        let (message_key, mut updated) = self.engine.derive_sending_key(&session)?;
        let public_key = updated.outgoing_public_key().to_vec();
        let aad = EncryptedMessage::associated_data(counter, &public_key);
        let (iv, ciphertext) = seal(message_key.as_bytes(), plaintext, &aad)?;
        let message = EncryptedMessage::new(counter, iv.to_vec(), public_key, ciphertext)?;

        updated.touch();
        self.sessions.save_session(&updated).await?;
        debug!("encrypted message {counter} for {peer_id}");
        Ok(message.to_bytes())
    }

    /// decrypt_from_peer authenticates and decrypts one serialized message.
    ///
    /// Without a stored session the message must carry a handshake header whose identity key is the one the directory lists for `peer_id`; the session derived from it is saved only if the message authenticates. On any error the stored session is left as it was.
    pub async fn decrypt_from_peer(&self, peer_id: &str, bytes: &[u8]) -> Result<Vec<u8>, Error> {
        let message = EncryptedMessage::from_bytes(bytes)?;
        let _guard = self.lock_peer(peer_id).await;

        let (session, consumed_prekey) = match self.sessions.get_session(peer_id).await? {
            Some(session) => {
                check_known_identity(&session, &message)?;
                (session, None)
            }
            None => self.respond(peer_id, &message).await?,
        };

        let (message_key, mut updated) = match self.engine.derive_receiving_key(&session, message.counter()) {
            Ok(derived) => derived,
            Err(e) => {
                warn!("rejected message {} from {peer_id}: {e}", message.counter());
                return Err(e);
            }
        };
        let aad = EncryptedMessage::associated_data(message.counter(), message.public_key());
        let plaintext = match open(message_key.as_bytes(), message.iv(), message.ciphertext(), &aad) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!("message {} from {peer_id} failed authentication", message.counter());
                return Err(e);
            }
        };

        if updated.handshake_header.take().is_some() {
            debug!("{peer_id} answered the handshake");
        }
        updated.touch();
        match consumed_prekey {
            Some(public_key) => match self.sessions.save_session_consuming_prekey(&updated, public_key).await {
                Err(StoreError::PreKeyConsumed(key)) => {
                    return Err(Error::InsufficientKeyMaterial(format!(
                        "one-time pre-key {key} was already used by another session"
                    )))
                }
                other => other?,
            },
            None => self.sessions.save_session(&updated).await?,
        }
        debug!("decrypted message {} from {peer_id}", message.counter());
        Ok(plaintext)
    }

    /// logout wipes every session. The identity and pre-keys stay.
    pub async fn logout(&self) -> Result<(), Error> {
        let _gate = self.gate.write().await;
        self.sessions.clear_all_sessions().await?;
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).clear();
        info!("logged out, all sessions cleared");
        Ok(())
    }

    /// close releases the database. Later operations fail with StorageUnavailable.
    pub async fn close(&self) -> Result<(), Error> {
        Ok(self.db.close().await?)
    }

    async fn lock_peer(&self, peer_id: &str) -> PeerGuard<'_> {
        let gate = self.gate.read().await;
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(peer_id.to_string()).or_default())
        };
        let held = lock.lock_owned().await;
        PeerGuard {
            locks: &self.locks,
            peer_id: peer_id.to_string(),
            held: Some(held),
            _gate: gate,
        }
    }

    async fn initiate(&self, peer_id: &str) -> Result<SessionState, Error> {
        handshake::initiate(&self.identity, self.directory.as_ref(), peer_id, self.bundle_fetch_timeout).await
    }

    /// respond builds the responder session from the handshake header carried by `message`
    async fn respond(
        &self,
        peer_id: &str,
        message: &EncryptedMessage,
    ) -> Result<(SessionState, Option<[u8; 32]>), Error> {
        if !HandshakeHeader::looks_like_header(message.public_key()) {
            warn!("message from {peer_id} without a session or handshake header");
            return Err(Error::MalformedMessage(format!(
                "no session with {peer_id} and the message carries no handshake header"
            )));
        }
        let header = HandshakeHeader::parse(message.public_key())?;
        handshake::verify_peer_identity(self.directory.as_ref(), peer_id, &header, self.bundle_fetch_timeout).await?;
        let (signed_pre_key, _) = self
            .prekeys
            .signed_prekey_secret()
            .await?
            .ok_or_else(|| Error::InsufficientKeyMaterial("no signed pre-key has been published".into()))?;
        let one_time_pre_key = match &header.one_time_pre_key {
            Some(public_key) => Some(self.prekeys.one_time_prekey_secret(public_key).await?.ok_or_else(|| {
                Error::InsufficientKeyMaterial(format!(
                    "one-time pre-key {} is unknown or already consumed",
                    fingerprint(public_key)
                ))
            })?),
            None => None,
        };
        let session = handshake::respond(
            &self.identity,
            &signed_pre_key,
            one_time_pre_key.as_ref(),
            peer_id,
            &header,
        )?;
        Ok((session, header.one_time_pre_key))
    }
}

/// check_known_identity rejects a handshake header naming an identity other than the one the session was established with
fn check_known_identity(session: &SessionState, message: &EncryptedMessage) -> Result<(), Error> {
    if session.peer_identity().is_empty() || !HandshakeHeader::looks_like_header(message.public_key()) {
        return Ok(());
    }
    let header = HandshakeHeader::parse(message.public_key())?;
    if header.identity[..] != session.peer_identity()[..] {
        warn!(
            "message for the session with {} presents identity {}",
            session.recipient_id(),
            fingerprint(&header.identity)
        );
        return Err(Error::IdentityMismatch {
            peer: session.recipient_id().to_string(),
        });
    }
    Ok(())
}

async fn open_database(config: &SessionConfig) -> Result<Database, Error> {
    let db = match &config.database_path {
        Some(path) => Database::open(path).await?,
        None => Database::open_in_memory().await?,
    };
    Ok(db)
}

/* ------------------------------------------------------------------------- */

// TESTS
