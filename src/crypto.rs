//! Primitives shared by the handshake and the ratchet: HKDF expansion, AES-256-GCM sealing, randomness, and the Ed25519 to X25519 key mapping that lets one identity key both sign and take part in Diffie-Hellman.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::Error;

/// KEY_LENGTH is 32 bytes (curve points, scalars, chain and message keys)
pub const KEY_LENGTH: usize = 32;
/// IV_LENGTH is the 96-bit AES-GCM nonce
pub const IV_LENGTH: usize = 12;
/// SIGNATURE_LENGTH is an Ed25519 signature
pub const SIGNATURE_LENGTH: usize = 64;

/// random_bytes fills an array from the operating system CSPRNG
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// hkdf_expand runs HKDF-SHA256 extract-and-expand into a fixed size array
pub fn hkdf_expand<const N: usize>(salt: Option<&[u8]>, ikm: &[u8], info: &[u8]) -> Result<[u8; N], Error> {
    let kdf = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; N];
    kdf.expand(info, &mut okm)?;
    Ok(okm)
}

/// seal encrypts with AES-256-GCM under a fresh random iv. Returns (iv, ciphertext || tag).
pub fn seal(key: &[u8; KEY_LENGTH], plaintext: &[u8], aad: &[u8]) -> Result<([u8; IV_LENGTH], Vec<u8>), Error> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let iv: [u8; IV_LENGTH] = random_bytes();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), Payload { msg: plaintext, aad })
        .map_err(|_| Error::EncryptionFailed)?;
    Ok((iv, ciphertext))
}

/// open authenticates and decrypts. Any mismatch (key, iv, aad, ciphertext) is DecryptionFailed.
pub fn open(key: &[u8; KEY_LENGTH], iv: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, Error> {
    if iv.len() != IV_LENGTH {
        return Err(Error::DecryptionFailed);
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(iv), Payload { msg: ciphertext, aad })
        .map_err(|_| Error::DecryptionFailed)
}

/// key_array checks the length of a key taken off the wire or out of a bundle
pub fn key_array(bytes: &[u8], what: &str) -> Result<[u8; KEY_LENGTH], Error> {
    bytes
        .try_into()
        .map_err(|_| Error::InsufficientKeyMaterial(format!("{what} must be {KEY_LENGTH} bytes, got {}", bytes.len())))
}

/// verify_signature checks an Ed25519 signature made by an identity key
pub fn verify_signature(identity_key: &[u8; KEY_LENGTH], message: &[u8], signature: &[u8]) -> Result<(), Error> {
    let verifying_key = VerifyingKey::from_bytes(identity_key).map_err(|_| Error::InvalidSignature)?;
    let signature = Signature::from_slice(signature).map_err(|_| Error::InvalidSignature)?;
    verifying_key
        .verify_strict(message, &signature)
        .map_err(|_| Error::InvalidSignature)
}

/// x25519_public maps an Ed25519 identity key onto the Montgomery curve
pub fn x25519_public(identity_key: &[u8; KEY_LENGTH]) -> Result<PublicKey, Error> {
    let verifying_key = VerifyingKey::from_bytes(identity_key)
        .map_err(|_| Error::InsufficientKeyMaterial("identity key is not a valid Ed25519 point".into()))?;
    Ok(PublicKey::from(verifying_key.to_montgomery().to_bytes()))
}

/// x25519_secret derives the DH scalar matching x25519_public from an Ed25519 signing key
pub fn x25519_secret(signing_key: &SigningKey) -> StaticSecret {
    StaticSecret::from(signing_key.to_scalar_bytes())
}

/// fingerprint is a short hex digest of a public key, the only form key material takes in logs
pub fn fingerprint(public_key: &[u8]) -> String {
    hex::encode(&Sha256::digest(public_key)[..8])
}
