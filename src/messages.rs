//! Wire framing for encrypted messages.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! [4 bytes] counter (u32)
//! [2 bytes] iv length (u16)
//! [n bytes] iv
//! [2 bytes] public key length (u16)
//! [m bytes] public key
//! [rest]    ciphertext
//! ```
//!
//! The ciphertext has no length prefix, so a frame is only valid as one whole discrete message.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::error::Error;

/// HEADER_LENGTH is the fixed part of a frame: counter plus the two length fields
pub const HEADER_LENGTH: usize = 8;

/// EncryptedMessage is one ratchet message as it crosses the wire.
///
/// - counter: position of the message key in the sender's chain
/// - iv: AEAD nonce
/// - public_key: the sender's current ratchet public key. While a handshake is unanswered this carries the handshake header instead (see `handshake::HandshakeHeader`).
/// - ciphertext: AEAD output including the tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedMessage {
    counter: u32,
    iv: Vec<u8>,
    public_key: Vec<u8>,
    ciphertext: Vec<u8>,
}

impl EncryptedMessage {
    /// new fails when a variable field cannot be described by its u16 length prefix
    pub fn new(counter: u32, iv: Vec<u8>, public_key: Vec<u8>, ciphertext: Vec<u8>) -> Result<Self, Error> {
        if iv.len() > u16::MAX as usize {
            return Err(Error::MalformedMessage(format!("iv is {} bytes, limit is {}", iv.len(), u16::MAX)));
        }
        if public_key.len() > u16::MAX as usize {
            return Err(Error::MalformedMessage(format!(
                "public key is {} bytes, limit is {}",
                public_key.len(),
                u16::MAX
            )));
        }
        Ok(Self {
            counter,
            iv,
            public_key,
            ciphertext,
        })
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// associated_data binds the cleartext header to the AEAD tag: counter (LE) || public key
    pub fn associated_data(counter: u32, public_key: &[u8]) -> Vec<u8> {
        let mut aad = Vec::with_capacity(4 + public_key.len());
        aad.extend_from_slice(&counter.to_le_bytes());
        aad.extend_from_slice(public_key);
        aad
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LENGTH + self.iv.len() + self.public_key.len() + self.ciphertext.len()
    }

    /// to_bytes serializes the frame. Lengths were checked in `new`, so the casts cannot truncate.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.counter.to_le_bytes());
        out.extend_from_slice(&(self.iv.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&(self.public_key.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.public_key);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// from_bytes parses a frame, refusing buffers shorter than their declared fields
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader { bytes, offset: 0 };
        let counter = u32::from_le_bytes(reader.take_array("counter")?);
        let iv_len = u16::from_le_bytes(reader.take_array("iv length")?) as usize;
        let iv = reader.take(iv_len, "iv")?.to_vec();
        let public_key_len = u16::from_le_bytes(reader.take_array("public key length")?) as usize;
        let public_key = reader.take(public_key_len, "public key")?.to_vec();
        let ciphertext = reader.rest().to_vec();
        Ok(Self {
            counter,
            iv,
            public_key,
            ciphertext,
        })
    }

    /// to_base64 is the text form used when frames travel inside JSON or chat payloads
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }

    pub fn from_base64(text: &str) -> Result<Self, Error> {
        let bytes = BASE64
            .decode(text.trim())
            .map_err(|e| Error::MalformedMessage(format!("invalid base64: {e}")))?;
        Self::from_bytes(&bytes)
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize, field: &str) -> Result<&'a [u8], Error> {
        let end = self.offset.checked_add(len).filter(|end| *end <= self.bytes.len()).ok_or_else(|| {
            Error::MalformedMessage(format!(
                "{field} needs {len} bytes at offset {}, buffer is {} bytes",
                self.offset,
                self.bytes.len()
            ))
        })?;
        let bytes = self.bytes;
        let slice = &bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self, field: &str) -> Result<[u8; N], Error> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, field)?);
        Ok(out)
    }

    fn rest(&self) -> &'a [u8] {
        let bytes = self.bytes;
        &bytes[self.offset..]
    }
}

/* ------------------------------------------------------------------------- */

// TESTS
