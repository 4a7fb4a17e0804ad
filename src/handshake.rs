//! X3DH-style key agreement.
//!
//! The initiator fetches the peer's bundle, checks the signed pre-key signature and combines four Diffie-Hellman outputs:
//!
//! ```text
//! DH1 = DH(IK_a, SPK_b)
//! DH2 = DH(EK_a, IK_b)
//! DH3 = DH(EK_a, SPK_b)
//! DH4 = DH(EK_a, OPK_b)   only when the bundle carried a one-time pre-key
//! ```
//!
//! HKDF-SHA256 over `DH1 || DH2 || DH3 [|| DH4]` yields the root key and one chain key per direction. The initiator announces its ephemeral key, its identity key and the one-time pre-key it used in a `HandshakeHeader`, so the responder can run the mirrored computation from its own pre-key secrets when the first message arrives.

use std::future::Future;
use std::time::Duration;

use log::{debug, info, warn};
use rand_core::OsRng;
use x25519_dalek::{PublicKey, ReusableSecret, StaticSecret};
use zeroize::Zeroizing;

use crate::bundle::{KeyBundleService, PreKeyBundle};
use crate::crypto::{fingerprint, hkdf_expand, key_array, verify_signature, x25519_public, KEY_LENGTH, SIGNATURE_LENGTH};
use crate::error::{DirectoryError, Error};
use crate::identity::IdentityKeyPair;
use crate::ratchet::{ChainKey, RootKey, SessionState};

/// HANDSHAKE_CONTEXT_BYTES labels the HKDF output of the key agreement
const HANDSHAKE_CONTEXT_BYTES: &[u8] = b"duet x3dh";
/// SECRETS_LENGTH is root key plus two chain keys
const SECRETS_LENGTH: usize = 3 * KEY_LENGTH;

/// HandshakeHeader is what the responder needs to complete the handshake: `ephemeral || identity [|| one_time_pre_key]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeHeader {
    pub ephemeral: [u8; KEY_LENGTH],
    pub identity: [u8; KEY_LENGTH],
    pub one_time_pre_key: Option<[u8; KEY_LENGTH]>,
}

impl HandshakeHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 * KEY_LENGTH);
        out.extend_from_slice(&self.ephemeral);
        out.extend_from_slice(&self.identity);
        if let Some(one_time_pre_key) = &self.one_time_pre_key {
            out.extend_from_slice(one_time_pre_key);
        }
        out
    }

    /// parse accepts the 64 and 96 byte forms
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        let one_time_pre_key = match bytes.len() {
            64 => None,
            96 => Some(key_array(&bytes[64..], "one-time pre-key")?),
            n => {
                return Err(Error::InsufficientKeyMaterial(format!(
                    "handshake header must be 64 or 96 bytes, got {n}"
                )))
            }
        };
        Ok(Self {
            ephemeral: key_array(&bytes[..32], "ephemeral key")?,
            identity: key_array(&bytes[32..64], "identity key")?,
            one_time_pre_key,
        })
    }

    /// looks_like_header tells a header apart from a plain 32 byte ratchet key
    pub fn looks_like_header(bytes: &[u8]) -> bool {
        bytes.len() == 2 * KEY_LENGTH || bytes.len() == 3 * KEY_LENGTH
    }
}

/// derive_initial_secrets expands the concatenated DH outputs into (root key, initiator-to-responder chain, responder-to-initiator chain)
pub fn derive_initial_secrets(dh_outputs: &[u8]) -> Result<(RootKey, ChainKey, ChainKey), Error> {
    let okm = Zeroizing::new(hkdf_expand::<SECRETS_LENGTH>(None, dh_outputs, HANDSHAKE_CONTEXT_BYTES)?);
    let root = key_array(&okm[..32], "root key")?;
    let initiator_chain = key_array(&okm[32..64], "chain key")?;
    let responder_chain = key_array(&okm[64..], "chain key")?;
    Ok((
        RootKey::from_bytes(root),
        ChainKey::from_bytes(initiator_chain),
        ChainKey::from_bytes(responder_chain),
    ))
}

/// initiate fetches `peer_id`'s bundle, bounded by `timeout`, and runs the initiator side
pub async fn initiate(
    identity: &IdentityKeyPair,
    directory: &dyn KeyBundleService,
    peer_id: &str,
    timeout: Duration,
) -> Result<SessionState, Error> {
    let bundle = bounded(timeout, peer_id, directory.fetch_bundle(peer_id)).await?;
    initiate_with_bundle(identity, peer_id, &bundle)
}

/// verify_peer_identity checks that the identity key in `header` is the one the directory lists for `peer_id`
pub async fn verify_peer_identity(
    directory: &dyn KeyBundleService,
    peer_id: &str,
    header: &HandshakeHeader,
    timeout: Duration,
) -> Result<(), Error> {
    let listed = bounded(timeout, peer_id, directory.fetch_identity_key(peer_id)).await?;
    if listed[..] != header.identity[..] {
        warn!(
            "handshake for {peer_id} presents identity {}, directory lists {}",
            fingerprint(&header.identity),
            fingerprint(&listed)
        );
        return Err(Error::IdentityMismatch {
            peer: peer_id.to_string(),
        });
    }
    Ok(())
}

/// bounded runs a directory lookup under `timeout`
async fn bounded<T>(
    timeout: Duration,
    peer_id: &str,
    lookup: impl Future<Output = Result<T, DirectoryError>>,
) -> Result<T, Error> {
    match tokio::time::timeout(timeout, lookup).await {
        Ok(Ok(found)) => Ok(found),
        Ok(Err(e)) => {
            warn!("directory lookup for {peer_id} failed: {e}");
            Err(Error::BundleFetchFailed(e))
        }
        Err(_) => {
            warn!("directory lookup for {peer_id} timed out");
            Err(Error::BundleFetchFailed(DirectoryError::Timeout(timeout.as_millis() as u64)))
        }
    }
}

/// initiate_with_bundle runs the initiator side against a bundle already in hand
pub fn initiate_with_bundle(
    identity: &IdentityKeyPair,
    peer_id: &str,
    bundle: &PreKeyBundle,
) -> Result<SessionState, Error> {
    if bundle.identity_key.is_empty() || bundle.signed_pre_key.is_empty() || bundle.signed_pre_key_signature.is_empty() {
        return Err(Error::InsufficientKeyMaterial("bundle is missing required keys".into()));
    }
    let peer_identity = key_array(&bundle.identity_key, "identity key")?;
    let signed_pre_key = key_array(&bundle.signed_pre_key, "signed pre-key")?;
    if bundle.signed_pre_key_signature.len() != SIGNATURE_LENGTH {
        return Err(Error::InsufficientKeyMaterial(format!(
            "signed pre-key signature must be {SIGNATURE_LENGTH} bytes, got {}",
            bundle.signed_pre_key_signature.len()
        )));
    }
    let one_time_pre_key = bundle
        .one_time_pre_key
        .as_deref()
        .map(|key| key_array(key, "one-time pre-key"))
        .transpose()?;

    if let Err(e) = verify_signature(&peer_identity, &signed_pre_key, &bundle.signed_pre_key_signature) {
        warn!(
            "signed pre-key of {peer_id} does not verify against identity {}",
            fingerprint(&peer_identity)
        );
        return Err(e);
    }

    let peer_identity_dh = x25519_public(&peer_identity)?;
    let signed_pre_key_dh = PublicKey::from(signed_pre_key);
    let ephemeral = ReusableSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();

    let mut dh_outputs = Zeroizing::new(Vec::with_capacity(4 * KEY_LENGTH));
    dh_outputs.extend_from_slice(identity.diffie_hellman(&signed_pre_key_dh).as_bytes());
    dh_outputs.extend_from_slice(ephemeral.diffie_hellman(&peer_identity_dh).as_bytes());
    dh_outputs.extend_from_slice(ephemeral.diffie_hellman(&signed_pre_key_dh).as_bytes());
    if let Some(one_time_pre_key) = one_time_pre_key {
        dh_outputs.extend_from_slice(ephemeral.diffie_hellman(&PublicKey::from(one_time_pre_key)).as_bytes());
    }
    let (root_key, sending, receiving) = derive_initial_secrets(&dh_outputs)?;

    let header = HandshakeHeader {
        ephemeral: ephemeral_public,
        identity: identity.public_key(),
        one_time_pre_key,
    };
    info!(
        "initiated session with {peer_id} (identity {}, one-time pre-key: {})",
        fingerprint(&peer_identity),
        bundle.has_one_time_pre_key()
    );
    Ok(SessionState::new(
        peer_id,
        root_key,
        sending,
        receiving,
        ephemeral_public.to_vec(),
        Some(header.encode()),
    )
    .with_peer_identity(&peer_identity))
}

/// respond mirrors the initiator's computation from the header and the local pre-key secrets.
///
/// `one_time_pre_key` must be the secret matching `header.one_time_pre_key`.
pub fn respond(
    identity: &IdentityKeyPair,
    signed_pre_key: &StaticSecret,
    one_time_pre_key: Option<&StaticSecret>,
    peer_id: &str,
    header: &HandshakeHeader,
) -> Result<SessionState, Error> {
    if header.one_time_pre_key.is_some() != one_time_pre_key.is_some() {
        return Err(Error::InsufficientKeyMaterial(
            "one-time pre-key named in the handshake is not available".into(),
        ));
    }
    let peer_identity_dh = x25519_public(&header.identity)?;
    let ephemeral = PublicKey::from(header.ephemeral);

    let mut dh_outputs = Zeroizing::new(Vec::with_capacity(4 * KEY_LENGTH));
    dh_outputs.extend_from_slice(signed_pre_key.diffie_hellman(&peer_identity_dh).as_bytes());
    dh_outputs.extend_from_slice(identity.diffie_hellman(&ephemeral).as_bytes());
    dh_outputs.extend_from_slice(signed_pre_key.diffie_hellman(&ephemeral).as_bytes());
    if let Some(one_time_pre_key) = one_time_pre_key {
        dh_outputs.extend_from_slice(one_time_pre_key.diffie_hellman(&ephemeral).as_bytes());
    }
    let (root_key, receiving, sending) = derive_initial_secrets(&dh_outputs)?;

    debug!(
        "derived responder session for {peer_id} (identity {})",
        fingerprint(&header.identity)
    );
    Ok(SessionState::new(
        peer_id,
        root_key,
        sending,
        receiving,
        PublicKey::from(signed_pre_key).to_bytes().to_vec(),
        None,
    )
    .with_peer_identity(&header.identity))
}

/* ------------------------------------------------------------------------- */

// TESTS

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::MemoryDirectory;
    use async_trait::async_trait;

    struct Responder {
        identity: IdentityKeyPair,
        signed_pre_key: StaticSecret,
        one_time_pre_key: StaticSecret,
    }

    impl Responder {
        fn new() -> Self {
            Self {
                identity: IdentityKeyPair::generate(),
                signed_pre_key: StaticSecret::random_from_rng(OsRng),
                one_time_pre_key: StaticSecret::random_from_rng(OsRng),
            }
        }

        fn bundle(&self, with_one_time: bool) -> PreKeyBundle {
            let signed_pre_key = PublicKey::from(&self.signed_pre_key).to_bytes();
            PreKeyBundle {
                identity_key: self.identity.public_key().to_vec(),
                signed_pre_key: signed_pre_key.to_vec(),
                signed_pre_key_signature: self.identity.sign(&signed_pre_key).to_vec(),
                one_time_pre_key: with_one_time.then(|| PublicKey::from(&self.one_time_pre_key).to_bytes().to_vec()),
            }
        }
    }

    fn assert_mirrored(initiator: &SessionState, responder: &SessionState) {
        assert_eq!(initiator.root_key(), responder.root_key());
        assert_eq!(initiator.sending_chain(), responder.receiving_chain());
        assert_eq!(initiator.receiving_chain(), responder.sending_chain());
        assert_eq!(initiator.sending_counter(), 0);
        assert_eq!(responder.receiving_counter(), 0);
    }

    #[test]
    fn handshake_is_symmetric_with_one_time_pre_key() {
        let alice = IdentityKeyPair::generate();
        let bob = Responder::new();
        let session = initiate_with_bundle(&alice, "bob", &bob.bundle(true)).unwrap();

        let header = HandshakeHeader::parse(session.handshake_header().unwrap()).unwrap();
        assert_eq!(header.identity, alice.public_key());
        assert_eq!(header.ephemeral.to_vec(), session.ratchet_key());
        assert!(header.one_time_pre_key.is_some());

        let mirrored = respond(&bob.identity, &bob.signed_pre_key, Some(&bob.one_time_pre_key), "alice", &header).unwrap();
        assert_mirrored(&session, &mirrored);
        assert_eq!(session.peer_identity(), bob.identity.public_key());
        assert_eq!(mirrored.peer_identity(), alice.public_key());
        assert_eq!(mirrored.handshake_header(), None);
        assert_eq!(mirrored.ratchet_key(), PublicKey::from(&bob.signed_pre_key).as_bytes());
    }

    #[test]
    fn handshake_is_symmetric_without_one_time_pre_key() {
        let alice = IdentityKeyPair::generate();
        let bob = Responder::new();
        let session = initiate_with_bundle(&alice, "bob", &bob.bundle(false)).unwrap();
        let header = HandshakeHeader::parse(session.handshake_header().unwrap()).unwrap();
        assert_eq!(header.one_time_pre_key, None);
        let mirrored = respond(&bob.identity, &bob.signed_pre_key, None, "alice", &header).unwrap();
        assert_mirrored(&session, &mirrored);
    }

    #[test]
    fn wrong_one_time_pre_key_diverges() {
        let alice = IdentityKeyPair::generate();
        let bob = Responder::new();
        let session = initiate_with_bundle(&alice, "bob", &bob.bundle(true)).unwrap();
        let header = HandshakeHeader::parse(session.handshake_header().unwrap()).unwrap();
        let other = StaticSecret::random_from_rng(OsRng);
        let mirrored = respond(&bob.identity, &bob.signed_pre_key, Some(&other), "alice", &header).unwrap();
        assert_ne!(session.root_key(), mirrored.root_key());
        assert!(matches!(
            respond(&bob.identity, &bob.signed_pre_key, None, "alice", &header),
            Err(Error::InsufficientKeyMaterial(_))
        ));
    }

    #[test]
    fn fresh_ephemeral_per_handshake() {
        let alice = IdentityKeyPair::generate();
        let bob = Responder::new();
        let first = initiate_with_bundle(&alice, "bob", &bob.bundle(false)).unwrap();
        let second = initiate_with_bundle(&alice, "bob", &bob.bundle(false)).unwrap();
        assert_ne!(first.root_key(), second.root_key());
        assert_ne!(first.ratchet_key(), second.ratchet_key());
    }

    #[test]
    fn invalid_signature_is_rejected() {
        let alice = IdentityKeyPair::generate();
        let bob = Responder::new();
        let mut bundle = bob.bundle(true);
        bundle.signed_pre_key_signature[0] ^= 1;
        assert!(matches!(
            initiate_with_bundle(&alice, "bob", &bundle),
            Err(Error::InvalidSignature)
        ));

        // A signature by some other identity is just as invalid
        let mallory = IdentityKeyPair::generate();
        let mut bundle = bob.bundle(true);
        bundle.signed_pre_key_signature = mallory.sign(&bundle.signed_pre_key).to_vec();
        assert!(matches!(
            initiate_with_bundle(&alice, "bob", &bundle),
            Err(Error::InvalidSignature)
        ));
    }

    #[test]
    fn missing_or_short_fields_are_insufficient() {
        let alice = IdentityKeyPair::generate();
        let bob = Responder::new();

        let mut bundle = bob.bundle(true);
        bundle.signed_pre_key.clear();
        assert!(matches!(
            initiate_with_bundle(&alice, "bob", &bundle),
            Err(Error::InsufficientKeyMaterial(_))
        ));

        let mut bundle = bob.bundle(true);
        bundle.identity_key.truncate(31);
        assert!(matches!(
            initiate_with_bundle(&alice, "bob", &bundle),
            Err(Error::InsufficientKeyMaterial(_))
        ));

        let mut bundle = bob.bundle(true);
        bundle.one_time_pre_key = Some(vec![1; 16]);
        assert!(matches!(
            initiate_with_bundle(&alice, "bob", &bundle),
            Err(Error::InsufficientKeyMaterial(_))
        ));
    }

    #[test]
    fn header_parsing() {
        let header = HandshakeHeader {
            ephemeral: [1; 32],
            identity: [2; 32],
            one_time_pre_key: Some([3; 32]),
        };
        let encoded = header.encode();
        assert_eq!(encoded.len(), 96);
        assert!(HandshakeHeader::looks_like_header(&encoded));
        assert_eq!(HandshakeHeader::parse(&encoded).unwrap(), header);
        assert_eq!(HandshakeHeader::parse(&encoded[..64]).unwrap().one_time_pre_key, None);
        assert!(!HandshakeHeader::looks_like_header(&[0u8; 32]));
        assert!(HandshakeHeader::parse(&encoded[..70]).is_err());
    }

    #[tokio::test]
    async fn initiate_through_directory() {
        let alice = IdentityKeyPair::generate();
        let bob = Responder::new();
        let directory = MemoryDirectory::new();
        let bundle = bob.bundle(true);
        directory
            .publish(
                "bob",
                crate::bundle::PublishedKeys {
                    identity_key: bundle.identity_key,
                    signed_pre_key: bundle.signed_pre_key,
                    signed_pre_key_signature: bundle.signed_pre_key_signature,
                    one_time_pre_keys: bundle.one_time_pre_key.into_iter().collect(),
                },
            )
            .unwrap();

        let session = initiate(&alice, &directory, "bob", Duration::from_secs(1)).await.unwrap();
        assert_eq!(session.recipient_id(), "bob");
        assert!(matches!(
            initiate(&alice, &directory, "carol", Duration::from_secs(1)).await,
            Err(Error::BundleFetchFailed(DirectoryError::PeerNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn peer_identity_must_match_directory() {
        let alice = IdentityKeyPair::generate();
        let mallory = IdentityKeyPair::generate();
        let bob = Responder::new();
        let directory = MemoryDirectory::new();
        directory
            .publish(
                "alice",
                crate::bundle::PublishedKeys {
                    identity_key: alice.public_key().to_vec(),
                    signed_pre_key: vec![0; 32],
                    signed_pre_key_signature: vec![0; 64],
                    one_time_pre_keys: Vec::new(),
                },
            )
            .unwrap();

        let genuine = initiate_with_bundle(&alice, "bob", &bob.bundle(false)).unwrap();
        let header = HandshakeHeader::parse(genuine.handshake_header().unwrap()).unwrap();
        verify_peer_identity(&directory, "alice", &header, Duration::from_secs(1)).await.unwrap();

        let forged = initiate_with_bundle(&mallory, "bob", &bob.bundle(false)).unwrap();
        let header = HandshakeHeader::parse(forged.handshake_header().unwrap()).unwrap();
        let err = verify_peer_identity(&directory, "alice", &header, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IdentityMismatch { ref peer } if peer == "alice"));
        assert!(matches!(
            verify_peer_identity(&directory, "nobody", &header, Duration::from_secs(1)).await,
            Err(Error::BundleFetchFailed(DirectoryError::PeerNotFound(_)))
        ));
    }

    struct Stalled;

    #[async_trait]
    impl KeyBundleService for Stalled {
        async fn fetch_bundle(&self, _peer_id: &str) -> Result<PreKeyBundle, DirectoryError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(DirectoryError::Network("unreachable".into()))
        }

        async fn fetch_identity_key(&self, _peer_id: &str) -> Result<Vec<u8>, DirectoryError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(DirectoryError::Network("unreachable".into()))
        }
    }

    #[tokio::test]
    async fn stalled_directory_times_out() {
        let alice = IdentityKeyPair::generate();
        let err = initiate(&alice, &Stalled, "bob", Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, Error::BundleFetchFailed(DirectoryError::Timeout(20))));
        assert!(err.is_retryable());
    }
}
