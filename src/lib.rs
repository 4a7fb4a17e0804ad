//! # Duet (Client Side)
//!
//! An end-to-end encrypted session layer for two-party messaging. A one-time X3DH-style handshake establishes a shared root key with a peer, and a symmetric ratchet then derives a fresh AES-256-GCM key for every message. Sessions, the identity key and local pre-keys are persisted in SQLite.
//!
//! ### Warnings and Disclaimers
//!
//! - This library and its protocol have NOT been audited.
//! - There is no Diffie-Hellman ratchet step after the handshake. A compromised chain key exposes every later message in that direction until a new session is established.
//! - Messages must be delivered in order unless the out-of-order policy is set to `tolerate`.
//! - Both parties initiating at the same moment is not resolved. One side should wait for the other's first message.
//! - `IdentityStore::generate_identity_key` replaces the stored identity. Every peer session breaks when it does.
//!
//! ### Examples / API
//!
//! Each user opens a `Principal` over a database and a directory client, and publishes their pre-keys.
//!
//! ```rust
//! let bob = Principal::open(&SessionConfig::with_database("bob.db"), directory.clone()).await?;
//! directory_upload(bob.publish_keys().await?);
//! ```
//!
//! Alice encrypts for Bob. The first call fetches Bob's bundle and runs the handshake.
//!
//! ```rust
//! let bytes = alice.encrypt_for_peer("bob", b"Hi Bob, did you know that cats are awesome?").await?;
//! ```
//!
//! Bob decrypts. Without a session, the handshake header carried by Alice's message is enough for Bob to derive the same keys.
//!
//! ```rust
//! let plaintext = bob.decrypt_from_peer("alice", &bytes).await?;
//! ```
//!
//! ### Under the Hood
//!
//! Every send takes one step of the sending chain and every receive one step of the receiving chain. The session is saved only after the step has been used successfully, so a rejected or forged message leaves the stored state untouched. Errors carry an `ErrorClass` telling the caller whether to retry, drop the message or give up on the handshake.

mod bundle;
mod config;
mod crypto;
mod error;
mod handshake;
mod identity;
mod messages;
mod prekeys;
mod principal;
mod ratchet;
mod store;

pub use bundle::{KeyBundleService, MemoryDirectory, PreKeyBundle, PublishedKeys};
pub use config::SessionConfig;
pub use crypto::fingerprint;
pub use error::{ConfigError, DirectoryError, Error, ErrorClass, StoreError};
pub use handshake::{derive_initial_secrets, initiate, initiate_with_bundle, respond, verify_peer_identity, HandshakeHeader};
pub use identity::{IdentityKeyPair, IdentityStore};
pub use messages::{EncryptedMessage, HEADER_LENGTH};
pub use prekeys::{PreKeyStore, SignedPreKey};
pub use principal::Principal;
pub use ratchet::{
    chain_step, Chain, ChainKey, MessageKey, OutOfOrderPolicy, RatchetEngine, RootKey, SessionState, DEFAULT_MAX_SKIP,
};
pub use store::{Database, SessionStore, SCHEMA_VERSION};
