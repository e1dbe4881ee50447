//! Property-based tests for envelope encryption
//!
//! These tests verify the fundamental invariants of the sealed-box
//! construction:
//!
//! 1. **Round-trip**: open(seal(m)) == m for all messages
//! 2. **Uniqueness**: distinct entropy/nonces produce distinct envelopes
//! 3. **Isolation**: only the intended recipient can open an envelope
//! 4. **Integrity**: any single-bit tamper is rejected

use proptest::prelude::*;
use tipline_crypto::{CryptoError, IdentityKeyPair, NONCE_SIZE, open, seal};

fn nonzero_entropy() -> impl Strategy<Value = [u8; 32]> {
    any::<[u8; 32]>().prop_filter("entropy must not be all zero", |e| e.iter().any(|b| *b != 0))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn roundtrip_preserves_plaintext(
        plaintext in proptest::collection::vec(any::<u8>(), 0..2048),
        recipient_entropy in nonzero_entropy(),
        ephemeral_entropy in nonzero_entropy(),
        nonce in any::<[u8; NONCE_SIZE]>(),
    ) {
        let recipient = IdentityKeyPair::from_entropy(recipient_entropy).unwrap();

        let envelope = seal(&plaintext, recipient.public(), ephemeral_entropy, nonce).unwrap();
        let opened = open(&envelope, &recipient).unwrap();

        prop_assert_eq!(opened, plaintext);
    }

    #[test]
    fn distinct_entropy_gives_distinct_ciphertext(
        plaintext in proptest::collection::vec(any::<u8>(), 1..512),
        recipient_entropy in nonzero_entropy(),
        entropy_a in nonzero_entropy(),
        entropy_b in nonzero_entropy(),
        nonce_a in any::<[u8; NONCE_SIZE]>(),
        nonce_b in any::<[u8; NONCE_SIZE]>(),
    ) {
        prop_assume!(entropy_a != entropy_b);

        let recipient = IdentityKeyPair::from_entropy(recipient_entropy).unwrap();

        let a = seal(&plaintext, recipient.public(), entropy_a, nonce_a).unwrap();
        let b = seal(&plaintext, recipient.public(), entropy_b, nonce_b).unwrap();

        prop_assert_ne!(a.ciphertext, b.ciphertext);
        prop_assert_ne!(a.ephemeral_public, b.ephemeral_public);
    }

    #[test]
    fn only_intended_recipient_can_open(
        plaintext in proptest::collection::vec(any::<u8>(), 0..512),
        recipient_entropy in nonzero_entropy(),
        intruder_entropy in nonzero_entropy(),
        ephemeral_entropy in nonzero_entropy(),
        nonce in any::<[u8; NONCE_SIZE]>(),
    ) {
        prop_assume!(recipient_entropy != intruder_entropy);

        let recipient = IdentityKeyPair::from_entropy(recipient_entropy).unwrap();
        let intruder = IdentityKeyPair::from_entropy(intruder_entropy).unwrap();

        let envelope = seal(&plaintext, recipient.public(), ephemeral_entropy, nonce).unwrap();

        let result = open(&envelope, &intruder);
        prop_assert!(matches!(result, Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn any_tampered_byte_is_rejected(
        plaintext in proptest::collection::vec(any::<u8>(), 1..512),
        recipient_entropy in nonzero_entropy(),
        ephemeral_entropy in nonzero_entropy(),
        nonce in any::<[u8; NONCE_SIZE]>(),
        flip in any::<u8>(),
        position in any::<prop::sample::Index>(),
    ) {
        prop_assume!(flip != 0);

        let recipient = IdentityKeyPair::from_entropy(recipient_entropy).unwrap();

        let mut envelope = seal(&plaintext, recipient.public(), ephemeral_entropy, nonce).unwrap();
        let index = position.index(envelope.ciphertext.len());
        envelope.ciphertext[index] ^= flip;

        let result = open(&envelope, &recipient);
        prop_assert!(matches!(result, Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn fingerprint_is_deterministic(recipient_entropy in nonzero_entropy()) {
        let pair = IdentityKeyPair::from_entropy(recipient_entropy).unwrap();
        prop_assert_eq!(pair.fingerprint(), pair.public().fingerprint());
    }
}
