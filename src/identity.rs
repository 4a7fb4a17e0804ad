//! The long-term identity key. One per local user, created lazily and kept in the `identity` table under the fixed id `current`.
//!
//! The key pair is Ed25519 so it can sign pre-keys. For Diffie-Hellman it is mapped onto X25519 (see `crypto::x25519_public`). The private half never leaves this module except as the blob written to the database.

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signer, SigningKey};
use log::{debug, info, warn};
use rand_core::OsRng;
use rusqlite::{params, Connection, OptionalExtension};
use x25519_dalek::{PublicKey, SharedSecret};
use zeroize::Zeroizing;

use crate::crypto::{fingerprint, x25519_secret, KEY_LENGTH, SIGNATURE_LENGTH};
use crate::error::StoreError;
use crate::store::{from_millis, key_from_blob, to_millis, Database};

/// IDENTITY_ROW is the primary key of the single identity record
const IDENTITY_ROW: &str = "current";

/// IdentityKeyPair is the local user's long-term key.
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
    created_at: DateTime<Utc>,
}

impl IdentityKeyPair {
    /// generate draws a fresh key pair from the OS CSPRNG
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
            created_at: Utc::now(),
        }
    }

    /// from_parts rebuilds a stored key pair and checks that both halves belong together
    pub(crate) fn from_parts(
        public_key: &[u8],
        private_key: &[u8],
        created_at: DateTime<Utc>,
    ) -> Result<Self, StoreError> {
        let private_key = Zeroizing::new(key_from_blob(private_key, "identity private key")?);
        let signing_key = SigningKey::from_bytes(&private_key);
        if signing_key.verifying_key().to_bytes()[..] != *public_key {
            return Err(StoreError::Corrupt("identity public key does not match private key".into()));
        }
        Ok(Self {
            signing_key,
            created_at,
        })
    }

    pub fn public_key(&self) -> [u8; KEY_LENGTH] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// fingerprint is the short hex form shown to users and written to logs
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.signing_key.sign(message).to_bytes()
    }

    /// diffie_hellman runs X25519 between the mapped identity secret and `public`
    pub(crate) fn diffie_hellman(&self, public: &PublicKey) -> SharedSecret {
        x25519_secret(&self.signing_key).diffie_hellman(public)
    }

    fn private_bytes(&self) -> Zeroizing<[u8; KEY_LENGTH]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("fingerprint", &self.fingerprint())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// IdentityStore reads and writes the identity record.
#[derive(Clone)]
pub struct IdentityStore {
    db: Database,
}

impl IdentityStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn has_identity_key(&self) -> Result<bool, StoreError> {
        self.db
            .call(|conn| {
                let found: Option<i64> = conn
                    .query_row("SELECT 1 FROM identity WHERE id = ?1", params![IDENTITY_ROW], |row| row.get(0))
                    .optional()?;
                Ok(found.is_some())
            })
            .await
    }

    pub async fn get_identity_key(&self) -> Result<Option<IdentityKeyPair>, StoreError> {
        self.db.call(|conn| read_identity(conn)).await
    }

    /// generate_identity_key writes a fresh key pair, replacing any existing one.
    ///
    /// Replacing the identity breaks every session peers hold for this user. The session layer uses `ensure_identity_key` instead.
    pub async fn generate_identity_key(&self) -> Result<(), StoreError> {
        let identity = IdentityKeyPair::generate();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let replaced = read_identity(&tx)?;
                write_identity(&tx, &identity, true)?;
                tx.commit()?;
                match replaced {
                    Some(old) => warn!(
                        "identity key {} replaced by {}; existing peer sessions will no longer verify",
                        old.fingerprint(),
                        identity.fingerprint()
                    ),
                    None => info!("generated identity key {}", identity.fingerprint()),
                }
                Ok(())
            })
            .await
    }

    /// ensure_identity_key returns the stored identity, creating it only when none exists
    pub async fn ensure_identity_key(&self) -> Result<IdentityKeyPair, StoreError> {
        let candidate = IdentityKeyPair::generate();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let created = write_identity(&tx, &candidate, false)?;
                let identity = read_identity(&tx)?
                    .ok_or_else(|| StoreError::Corrupt("identity row vanished inside its transaction".into()))?;
                tx.commit()?;
                if created {
                    info!("generated identity key {}", identity.fingerprint());
                } else {
                    debug!("loaded identity key {}", identity.fingerprint());
                }
                Ok(identity)
            })
            .await
    }

    /// get_public_identity_key is the base64 public key, as published to the directory
    pub async fn get_public_identity_key(&self) -> Result<Option<String>, StoreError> {
        Ok(self
            .get_identity_key()
            .await?
            .map(|identity| BASE64.encode(identity.public_key())))
    }
}

fn read_identity(conn: &Connection) -> Result<Option<IdentityKeyPair>, StoreError> {
    let row = conn
        .query_row(
            "SELECT public_key, private_key, created_at FROM identity WHERE id = ?1",
            params![IDENTITY_ROW],
            |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    Zeroizing::new(row.get::<_, Vec<u8>>(1)?),
                    row.get::<_, i64>(2)?,
                ))
            },
        )
        .optional()?;
    match row {
        Some((public_key, private_key, created_at)) => Ok(Some(IdentityKeyPair::from_parts(
            &public_key,
            &private_key,
            from_millis(created_at)?,
        )?)),
        None => Ok(None),
    }
}

/// write_identity inserts the record. With `overwrite` unset an existing record wins and false is returned.
fn write_identity(conn: &Connection, identity: &IdentityKeyPair, overwrite: bool) -> Result<bool, StoreError> {
    let sql = if overwrite {
        "INSERT OR REPLACE INTO identity (id, public_key, private_key, created_at) VALUES (?1, ?2, ?3, ?4)"
    } else {
        "INSERT OR IGNORE INTO identity (id, public_key, private_key, created_at) VALUES (?1, ?2, ?3, ?4)"
    };
    let private_key = identity.private_bytes();
    let written = conn.execute(
        sql,
        params![
            IDENTITY_ROW,
            &identity.public_key()[..],
            &private_key[..],
            to_millis(identity.created_at)
        ],
    )?;
    Ok(written == 1)
}

/* ------------------------------------------------------------------------- */

// TESTS
