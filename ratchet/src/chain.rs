//! Symmetric chain-key advancement and per-message AEAD keying (§4.5).

use crate::primitives::{hkdf_expand_blocks, hmac_sha256, AES256_KEY_LEN, AES256_NONCE_LEN};

const MESSAGE_KEYS_INFO: &[u8] = b"WhisperMessageKeys";

/// A sending or receiving chain key. Advancing consumes `self` and returns
/// the successor chain key plus the raw message-key precursor for the step
/// just taken.
#[derive(Clone, Copy)]
pub struct ChainKey {
    pub key: [u8; 32],
    pub counter: u32,
}

impl ChainKey {
    pub fn new(key: [u8; 32]) -> Self {
        ChainKey { key, counter: 0 }
    }

    /// `CK' = HMAC(CK, 0x02)`; `MK_raw = HMAC(CK, 0x01)`.
    pub fn advance(&self) -> (ChainKey, [u8; 32]) {
        let mk_raw = hmac_sha256(&self.key, &[0x01]);
        let next_key = hmac_sha256(&self.key, &[0x02]);
        (
            ChainKey {
                key: next_key,
                counter: self.counter + 1,
            },
            mk_raw,
        )
    }
}

/// The three 32-byte blocks `HKDF(MK_raw, 3, zeros, "WhisperMessageKeys")`
/// expands into: an AEAD key, a MessageSigned HMAC key, and an AEAD nonce
/// (first 12 bytes of the third block).
pub struct MessageKeys {
    pub aes_key: [u8; AES256_KEY_LEN],
    pub hmac_key: [u8; 32],
    pub nonce: [u8; AES256_NONCE_LEN],
}

pub fn derive_message_keys(mk_raw: &[u8; 32]) -> MessageKeys {
    let blocks = hkdf_expand_blocks(mk_raw, Some(&[0u8; 32]), MESSAGE_KEYS_INFO, 3)
        .expect("fixed-length HKDF input/output never fails");
    let mut nonce = [0u8; AES256_NONCE_LEN];
    nonce.copy_from_slice(&blocks[2][..AES256_NONCE_LEN]);
    MessageKeys {
        aes_key: blocks[0],
        hmac_key: blocks[1],
        nonce,
    }
}

/// The 8-byte big-endian `(counter || previousCounter)` AAD binding.
pub fn header_aad(counter: u32, previous_counter: u32) -> [u8; 8] {
    let mut aad = [0u8; 8];
    aad[..4].copy_from_slice(&counter.to_be_bytes());
    aad[4..].copy_from_slice(&previous_counter.to_be_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advancing_is_one_way_and_deterministic() {
        let ck = ChainKey::new([1u8; 32]);
        let (ck1, mk1) = ck.advance();
        let (ck2, mk2) = ck.advance();
        assert_eq!(ck1.key, ck2.key);
        assert_eq!(mk1, mk2);
        assert_eq!(ck1.counter, 1);
        assert_ne!(ck1.key, ck.key);
    }

    #[test]
    fn message_keys_are_independent_blocks() {
        let (_, mk_raw) = ChainKey::new([2u8; 32]).advance();
        let keys = derive_message_keys(&mk_raw);
        assert_ne!(keys.aes_key, keys.hmac_key);
        assert_ne!(&keys.aes_key[..12], &keys.nonce[..]);
    }

    #[test]
    fn header_aad_is_big_endian() {
        let aad = header_aad(1, 0);
        assert_eq!(aad, [0, 0, 0, 1, 0, 0, 0, 0]);
    }
}
