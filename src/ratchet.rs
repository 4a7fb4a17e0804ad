//! The symmetric ratchet. Each session holds a sending chain and a receiving chain; every message consumes exactly one step of one chain. A step is a one-way HKDF derivation, so a chain key cannot be walked backwards to earlier message keys.
//!
//! The engine never mutates a session in place. Both derivations take the current state and hand back the message key together with the successor state, and the caller persists the successor only once the message key has done its job (sealed or authenticated a message). A failed decryption therefore leaves the stored session exactly as it was.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{hkdf_expand, KEY_LENGTH};
use crate::error::Error;

/// CHAIN_CONTEXT_BYTES labels the HKDF output that becomes the next chain key
const CHAIN_CONTEXT_BYTES: &[u8] = b"duet ratchet chain";
/// MESSAGE_CONTEXT_BYTES labels the HKDF output that becomes the message key
const MESSAGE_CONTEXT_BYTES: &[u8] = b"duet ratchet message";
/// DEFAULT_MAX_SKIP bounds how far ahead of the receiving chain a message may be when reordering is tolerated
pub const DEFAULT_MAX_SKIP: u32 = 1000;

macro_rules! secret_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
        pub struct $name([u8; KEY_LENGTH]);

        impl $name {
            pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(concat!(stringify!($name), "(..)"))
            }
        }
    };
}

secret_key!(
    /// Output of the handshake; kept with the session
    RootKey
);
secret_key!(
    /// Current head of a sending or receiving chain
    ChainKey
);
secret_key!(
    /// Encrypts exactly one message
    MessageKey
);

/// chain_step advances a chain key by one step: (next chain key, message key)
pub fn chain_step(chain_key: &ChainKey) -> Result<(ChainKey, MessageKey), Error> {
    let next = hkdf_expand(None, chain_key.as_bytes(), CHAIN_CONTEXT_BYTES)?;
    let message = hkdf_expand(None, chain_key.as_bytes(), MESSAGE_CONTEXT_BYTES)?;
    Ok((ChainKey(next), MessageKey(message)))
}

/// A chain key together with the counter of the next message it will produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    key: ChainKey,
    counter: u32,
}

impl Chain {
    pub fn new(key: ChainKey, counter: u32) -> Self {
        Self { key, counter }
    }

    pub fn key(&self) -> &ChainKey {
        &self.key
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }
}

/// SessionState is everything one side knows about a conversation with one peer.
///
/// - recipient_id: the peer, and the primary key of the stored record
/// - root_key: handshake output
/// - sending_chain / receiving_chain: the two symmetric chains
/// - ratchet_key: public key placed in outgoing messages
/// - handshake_header: set on the initiating side until the peer answers; sent instead of ratchet_key so the peer can complete the handshake from any early message
/// - peer_identity: the peer's identity key as checked during the handshake. Empty for records written before it was stored.
/// - skipped_keys: message keys derived past a gap, only used when reordering is tolerated
/// - last_used: refreshed on every successful send or receive
#[derive(Debug, Clone)]
pub struct SessionState {
    pub(crate) recipient_id: String,
    pub(crate) root_key: RootKey,
    pub(crate) sending_chain: Chain,
    pub(crate) receiving_chain: Chain,
    pub(crate) ratchet_key: Vec<u8>,
    pub(crate) handshake_header: Option<Vec<u8>>,
    pub(crate) peer_identity: Vec<u8>,
    pub(crate) skipped_keys: BTreeMap<u32, MessageKey>,
    pub(crate) last_used: DateTime<Utc>,
}

impl SessionState {
    /// new builds a fresh session with both counters at 0
    pub fn new(
        recipient_id: &str,
        root_key: RootKey,
        sending_chain_key: ChainKey,
        receiving_chain_key: ChainKey,
        ratchet_key: Vec<u8>,
        handshake_header: Option<Vec<u8>>,
    ) -> Self {
        Self {
            recipient_id: recipient_id.to_string(),
            root_key,
            sending_chain: Chain::new(sending_chain_key, 0),
            receiving_chain: Chain::new(receiving_chain_key, 0),
            ratchet_key,
            handshake_header,
            peer_identity: Vec::new(),
            skipped_keys: BTreeMap::new(),
            last_used: Utc::now(),
        }
    }

    /// with_peer_identity records the identity key the handshake was run against
    pub fn with_peer_identity(mut self, identity_key: &[u8]) -> Self {
        self.peer_identity = identity_key.to_vec();
        self
    }

    pub fn recipient_id(&self) -> &str {
        &self.recipient_id
    }

    pub fn root_key(&self) -> &RootKey {
        &self.root_key
    }

    pub fn sending_chain(&self) -> &Chain {
        &self.sending_chain
    }

    pub fn receiving_chain(&self) -> &Chain {
        &self.receiving_chain
    }

    pub fn sending_counter(&self) -> u32 {
        self.sending_chain.counter
    }

    pub fn receiving_counter(&self) -> u32 {
        self.receiving_chain.counter
    }

    pub fn ratchet_key(&self) -> &[u8] {
        &self.ratchet_key
    }

    pub fn handshake_header(&self) -> Option<&[u8]> {
        self.handshake_header.as_deref()
    }

    pub fn peer_identity(&self) -> &[u8] {
        &self.peer_identity
    }

    pub fn skipped_key_count(&self) -> usize {
        self.skipped_keys.len()
    }

    pub fn last_used(&self) -> DateTime<Utc> {
        self.last_used
    }

    /// outgoing_public_key is what goes into the public key field of the next message
    pub(crate) fn outgoing_public_key(&self) -> &[u8] {
        self.handshake_header.as_deref().unwrap_or(&self.ratchet_key)
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Utc::now();
    }
}

/// What to do with a message whose counter is ahead of the receiving chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutOfOrderPolicy {
    /// Refuse it with `OutOfOrder`. The transport is trusted to deliver in order.
    #[default]
    Reject,
    /// Derive and cache the keys of the gap (bounded by max_skip), then accept it.
    Tolerate,
}

/// RatchetEngine derives message keys and successor states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatchetEngine {
    policy: OutOfOrderPolicy,
    max_skip: u32,
}

impl Default for RatchetEngine {
    fn default() -> Self {
        Self::new(OutOfOrderPolicy::default(), DEFAULT_MAX_SKIP)
    }
}

impl RatchetEngine {
    pub fn new(policy: OutOfOrderPolicy, max_skip: u32) -> Self {
        Self { policy, max_skip }
    }

    pub fn policy(&self) -> OutOfOrderPolicy {
        self.policy
    }

    /// derive_sending_key produces the key for message number `sending_counter` and a state whose counter is one higher
    pub fn derive_sending_key(&self, session: &SessionState) -> Result<(MessageKey, SessionState), Error> {
        let next_counter = session.sending_chain.counter.checked_add(1).ok_or(Error::ChainExhausted)?;
        let (next_chain, message_key) = chain_step(&session.sending_chain.key)?;
        let mut updated = session.clone();
        updated.sending_chain = Chain::new(next_chain, next_counter);
        Ok((message_key, updated))
    }

    /// derive_receiving_key produces the key for message number `counter`.
    ///
    /// A counter below the chain position is a replay unless its key is still cached from an earlier gap. A counter above it is handled by the out-of-order policy.
    pub fn derive_receiving_key(&self, session: &SessionState, counter: u32) -> Result<(MessageKey, SessionState), Error> {
        let expected = session.receiving_chain.counter;
        if counter < expected {
            if session.skipped_keys.contains_key(&counter) {
                let mut updated = session.clone();
                if let Some(message_key) = updated.skipped_keys.remove(&counter) {
                    return Ok((message_key, updated));
                }
            }
            return Err(Error::ReplayDetected { counter, expected });
        }

        let mut updated = session.clone();
        if counter > expected {
            match self.policy {
                OutOfOrderPolicy::Reject => return Err(Error::OutOfOrder { counter, expected }),
                OutOfOrderPolicy::Tolerate => {
                    let requested = counter - expected;
                    if requested > self.max_skip {
                        return Err(Error::TooManySkipped {
                            max: self.max_skip,
                            requested,
                        });
                    }
                    while updated.receiving_chain.counter < counter {
                        let position = updated.receiving_chain.counter;
                        let (next_chain, message_key) = chain_step(&updated.receiving_chain.key)?;
                        updated.skipped_keys.insert(position, message_key);
                        updated.receiving_chain = Chain::new(next_chain, position + 1);
                    }
                    // Oldest cached keys go first once the cache is full
                    while updated.skipped_keys.len() > self.max_skip as usize {
                        updated.skipped_keys.pop_first();
                    }
                }
            }
        }

        let next_counter = counter.checked_add(1).ok_or(Error::ChainExhausted)?;
        let (next_chain, message_key) = chain_step(&updated.receiving_chain.key)?;
        updated.receiving_chain = Chain::new(next_chain, next_counter);
        Ok((message_key, updated))
    }
}

/* ------------------------------------------------------------------------- */

// TESTS

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (SessionState, SessionState) {
        let alice = SessionState::new(
            "bob",
            RootKey::from_bytes([9u8; 32]),
            ChainKey::from_bytes([1u8; 32]),
            ChainKey::from_bytes([2u8; 32]),
            vec![0xa; 32],
            None,
        );
        let bob = SessionState::new(
            "alice",
            RootKey::from_bytes([9u8; 32]),
            ChainKey::from_bytes([2u8; 32]),
            ChainKey::from_bytes([1u8; 32]),
            vec![0xb; 32],
            None,
        );
        (alice, bob)
    }

    #[test]
    fn chain_step_is_deterministic() {
        let first = ChainKey::from_bytes([5u8; 32]);
        let second = ChainKey::from_bytes([5u8; 32]);
        let (next_a, message_a) = chain_step(&first).unwrap();
        let (next_b, message_b) = chain_step(&second).unwrap();
        assert_eq!(next_a, next_b);
        assert_eq!(message_a, message_b);
        // Output keys differ from the input and from each other
        assert_ne!(next_a.as_bytes(), first.as_bytes());
        assert_ne!(next_a.as_bytes(), message_a.as_bytes());
    }

    #[test]
    fn two_engines_agree() {
        let (alice, _) = pair();
        let (key_a, state_a) = RatchetEngine::default().derive_sending_key(&alice).unwrap();
        let (key_b, state_b) = RatchetEngine::new(OutOfOrderPolicy::Tolerate, 5).derive_sending_key(&alice).unwrap();
        assert_eq!(key_a, key_b);
        assert_eq!(state_a.sending_chain, state_b.sending_chain);
    }

    #[test]
    fn sending_counter_is_monotonic() {
        let engine = RatchetEngine::default();
        let (mut alice, _) = pair();
        let mut seen = Vec::new();
        for n in 0..5 {
            assert_eq!(alice.sending_counter(), n);
            let (key, next) = engine.derive_sending_key(&alice).unwrap();
            assert!(!seen.contains(&key));
            seen.push(key);
            alice = next;
        }
        assert_eq!(alice.sending_counter(), 5);
    }

    #[test]
    fn old_chain_key_is_not_kept() {
        let engine = RatchetEngine::default();
        let (alice, _) = pair();
        let (_, next) = engine.derive_sending_key(&alice).unwrap();
        assert_ne!(next.sending_chain().key(), alice.sending_chain().key());
        assert_eq!(next.sending_chain().key(), &chain_step(alice.sending_chain().key()).unwrap().0);
    }

    #[test]
    fn sender_and_receiver_keys_match() {
        let engine = RatchetEngine::default();
        let (mut alice, mut bob) = pair();
        for n in 0..3 {
            let (sent, next_alice) = engine.derive_sending_key(&alice).unwrap();
            let (received, next_bob) = engine.derive_receiving_key(&bob, n).unwrap();
            assert_eq!(sent, received);
            alice = next_alice;
            bob = next_bob;
        }
        assert_eq!(alice.sending_counter(), 3);
        assert_eq!(bob.receiving_counter(), 3);
    }

    #[test]
    fn replay_is_rejected() {
        let engine = RatchetEngine::default();
        let (_, bob) = pair();
        let (_, bob) = engine.derive_receiving_key(&bob, 0).unwrap();
        let err = engine.derive_receiving_key(&bob, 0).unwrap_err();
        assert!(matches!(err, Error::ReplayDetected { counter: 0, expected: 1 }));
    }

    #[test]
    fn reject_policy_refuses_gaps() {
        let engine = RatchetEngine::default();
        let (_, bob) = pair();
        let err = engine.derive_receiving_key(&bob, 2).unwrap_err();
        assert!(matches!(err, Error::OutOfOrder { counter: 2, expected: 0 }));
        assert_eq!(bob.receiving_counter(), 0);
    }

    #[test]
    fn tolerate_policy_caches_and_consumes_skipped_keys() {
        let engine = RatchetEngine::new(OutOfOrderPolicy::Tolerate, 10);
        let (mut alice, bob) = pair();
        let mut sent = Vec::new();
        for _ in 0..3 {
            let (key, next) = engine.derive_sending_key(&alice).unwrap();
            sent.push(key);
            alice = next;
        }
        let (key2, bob) = engine.derive_receiving_key(&bob, 2).unwrap();
        assert_eq!(key2, sent[2]);
        assert_eq!(bob.receiving_counter(), 3);
        assert_eq!(bob.skipped_key_count(), 2);

        let (key0, bob) = engine.derive_receiving_key(&bob, 0).unwrap();
        assert_eq!(key0, sent[0]);
        assert_eq!(bob.skipped_key_count(), 1);

        // Consumed cache entries are replays
        assert!(matches!(
            engine.derive_receiving_key(&bob, 0),
            Err(Error::ReplayDetected { counter: 0, .. })
        ));
        let (key1, bob) = engine.derive_receiving_key(&bob, 1).unwrap();
        assert_eq!(key1, sent[1]);
        assert_eq!(bob.skipped_key_count(), 0);
    }

    #[test]
    fn tolerate_policy_bounds_the_gap() {
        let engine = RatchetEngine::new(OutOfOrderPolicy::Tolerate, 4);
        let (_, bob) = pair();
        assert!(matches!(
            engine.derive_receiving_key(&bob, 5),
            Err(Error::TooManySkipped { max: 4, requested: 5 })
        ));
        assert!(engine.derive_receiving_key(&bob, 4).is_ok());
    }

    #[test]
    fn skipped_cache_evicts_oldest() {
        let engine = RatchetEngine::new(OutOfOrderPolicy::Tolerate, 3);
        let (_, bob) = pair();
        let (_, bob) = engine.derive_receiving_key(&bob, 3).unwrap();
        assert_eq!(bob.skipped_key_count(), 3);
        let (_, bob) = engine.derive_receiving_key(&bob, 6).unwrap();
        assert_eq!(bob.skipped_key_count(), 3);
        // 0 and 1 made room for 4 and 5
        assert!(matches!(engine.derive_receiving_key(&bob, 0), Err(Error::ReplayDetected { .. })));
        assert!(engine.derive_receiving_key(&bob, 2).is_ok());
        assert!(engine.derive_receiving_key(&bob, 5).is_ok());
    }

    #[test]
    fn exhausted_sending_chain() {
        let engine = RatchetEngine::default();
        let (mut alice, _) = pair();
        alice.sending_chain = Chain::new(ChainKey::from_bytes([1u8; 32]), u32::MAX);
        assert!(matches!(engine.derive_sending_key(&alice), Err(Error::ChainExhausted)));
    }

    #[test]
    fn debug_output_hides_keys() {
        let (alice, _) = pair();
        let printed = format!("{alice:?}");
        assert!(printed.contains("ChainKey(..)"));
        assert!(!printed.contains("[1, 1, 1"));
    }
}
