//! Fixed-size key types, thumbprints, and the HKDF/HMAC/AEAD building blocks
//! every other module is built on.
//!
//! Keys are modeled as a tagged enum rather than bare byte slices passed
//! around untyped: [`CryptoKey`] gives every call site an exhaustive match
//! instead of a raw-bytes escape hatch.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand_core::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret as X25519Secret};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const X25519_LEN: usize = 32;
pub const ED25519_PUBLIC_LEN: usize = 32;
pub const ED25519_SECRET_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;
pub const SHA256_LEN: usize = 32;
pub const AES256_KEY_LEN: usize = 32;
pub const AES256_NONCE_LEN: usize = 12;
pub const AES256_TAG_LEN: usize = 16;

type HmacSha256 = Hmac<Sha256>;

/// Tagged crypto key material. Every primitive operation takes and returns
/// the variant appropriate to it; there is no untyped raw-bytes path.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub enum CryptoKey {
    X25519Public([u8; X25519_LEN]),
    X25519Secret([u8; X25519_LEN]),
    Ed25519Public([u8; ED25519_PUBLIC_LEN]),
    Ed25519Secret([u8; ED25519_SECRET_LEN]),
    HmacKey([u8; 32]),
    AesKey([u8; AES256_KEY_LEN]),
}

impl CryptoKey {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            CryptoKey::X25519Public(b) => b,
            CryptoKey::X25519Secret(b) => b,
            CryptoKey::Ed25519Public(b) => b,
            CryptoKey::Ed25519Secret(b) => b,
            CryptoKey::HmacKey(b) => b,
            CryptoKey::AesKey(b) => b,
        }
    }
}

/// A fixed-size X25519 public key, usable directly as a DH counterparty or
/// as the wire representation of a "curve public key" field.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct X25519Pub(pub [u8; X25519_LEN]);

impl X25519Pub {
    pub fn from_secret(secret: &X25519SecretKey) -> Self {
        X25519Pub(X25519Public::from(&secret.0).to_bytes())
    }

    pub fn diffie_hellman(&self, ours: &X25519SecretKey) -> [u8; X25519_LEN] {
        ours.0
            .diffie_hellman(&X25519Public::from(self.0))
            .to_bytes()
    }
}

impl AsRef<[u8]> for X25519Pub {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// An X25519 private scalar. Zeroized on drop; never serialized unless the
/// caller explicitly opts into `exportableKeys`.
#[derive(Clone, ZeroizeOnDrop)]
pub struct X25519SecretKey(X25519Secret);

impl X25519SecretKey {
    pub fn generate() -> Self {
        X25519SecretKey(X25519Secret::random_from_rng(OsRng))
    }

    pub fn from_bytes(bytes: [u8; X25519_LEN]) -> Self {
        X25519SecretKey(X25519Secret::from(bytes))
    }

    pub fn public(&self) -> X25519Pub {
        X25519Pub::from_secret(self)
    }

    pub fn to_bytes(&self) -> [u8; X25519_LEN] {
        self.0.to_bytes()
    }
}

/// An Ed25519 signing keypair used for the long-term identity's signing role.
#[derive(ZeroizeOnDrop)]
pub struct Ed25519KeyPair {
    #[zeroize(skip)]
    signing: SigningKey,
}

impl Ed25519KeyPair {
    pub fn generate() -> Self {
        Ed25519KeyPair {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: [u8; ED25519_SECRET_LEN]) -> Self {
        Ed25519KeyPair {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    pub fn public(&self) -> Ed25519Pub {
        Ed25519Pub(self.signing.verifying_key().to_bytes())
    }

    pub fn seed(&self) -> [u8; ED25519_SECRET_LEN] {
        self.signing.to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(message).to_bytes()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Ed25519Pub(pub [u8; ED25519_PUBLIC_LEN]);

impl Ed25519Pub {
    pub fn verify(&self, message: &[u8], signature: &[u8; SIGNATURE_LEN]) -> bool {
        let Ok(vk) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let sig = Signature::from_bytes(signature);
        vk.verify(message, &sig).is_ok()
    }
}

impl AsRef<[u8]> for Ed25519Pub {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// `HKDF(input, n, salt, info)`: extract-then-expand into `n` independent
/// 32-byte blocks. `salt = None` is treated by the underlying implementation
/// as a 32-byte zero vector, matching RFC 5869.
pub fn hkdf_expand_blocks(
    input: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    n: usize,
) -> Result<Vec<[u8; 32]>, hkdf::InvalidLength> {
    let hk = Hkdf::<Sha256>::new(salt, input);
    let mut okm = vec![0u8; n * 32];
    hk.expand(info, &mut okm)?;
    Ok(okm
        .chunks_exact(32)
        .map(|c| {
            let mut block = [0u8; 32];
            block.copy_from_slice(c);
            block
        })
        .collect())
}

/// `HMAC-SHA-256(key, message)`.
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// Constant-time verification of an HMAC-SHA-256 tag. Delegates to the
/// `hmac` crate's own constant-time `verify_slice`.
pub fn hmac_sha256_verify(key: &[u8], message: &[u8], tag: &[u8]) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return false;
    };
    mac.update(message);
    mac.verify_slice(tag).is_ok()
}

/// SHA-256 digest.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    use sha2::Digest;
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// `thumbprint(pk)`: SHA-256 of the 32-byte serialized public key, hex-encoded.
pub fn thumbprint(pk: &X25519Pub) -> String {
    hex::encode(sha256(&pk.0))
}

/// AES-256-GCM encrypt. Returns ciphertext with the 16-byte tag appended.
pub fn aes256_gcm_encrypt(
    key: &[u8; AES256_KEY_LEN],
    nonce: &[u8; AES256_NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, aes_gcm::Error> {
    let cipher = Aes256Gcm::new_from_slice(key).expect("32-byte key");
    cipher.encrypt(
        Nonce::from_slice(nonce),
        Payload {
            msg: plaintext,
            aad,
        },
    )
}

/// AES-256-GCM decrypt. `ciphertext` must include the trailing 16-byte tag.
pub fn aes256_gcm_decrypt(
    key: &[u8; AES256_KEY_LEN],
    nonce: &[u8; AES256_NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, aes_gcm::Error> {
    let cipher = Aes256Gcm::new_from_slice(key).expect("32-byte key");
    cipher.decrypt(
        Nonce::from_slice(nonce),
        Payload {
            msg: ciphertext,
            aad,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x25519_dh_converges() {
        let a = X25519SecretKey::generate();
        let b = X25519SecretKey::generate();
        let shared_a = b.public().diffie_hellman(&a);
        let shared_b = a.public().diffie_hellman(&b);
        assert_eq!(shared_a, shared_b);
    }

    #[test]
    fn ed25519_sign_verify_roundtrip() {
        let kp = Ed25519KeyPair::generate();
        let sig = kp.sign(b"hello");
        assert!(kp.public().verify(b"hello", &sig));
        assert!(!kp.public().verify(b"goodbye", &sig));
    }

    #[test]
    fn hkdf_blocks_are_independent() {
        let blocks = hkdf_expand_blocks(b"input", None, b"info", 3).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_ne!(blocks[0], blocks[1]);
        assert_ne!(blocks[1], blocks[2]);
    }

    #[test]
    fn hmac_verify_rejects_tampered_tag() {
        let key = [7u8; 32];
        let tag = hmac_sha256(&key, b"message");
        assert!(hmac_sha256_verify(&key, b"message", &tag));
        let mut bad = tag;
        bad[0] ^= 0xFF;
        assert!(!hmac_sha256_verify(&key, b"message", &bad));
    }

    #[test]
    fn aead_roundtrip() {
        let key = [1u8; AES256_KEY_LEN];
        let nonce = [2u8; AES256_NONCE_LEN];
        let ct = aes256_gcm_encrypt(&key, &nonce, b"plaintext", b"aad").unwrap();
        let pt = aes256_gcm_decrypt(&key, &nonce, &ct, b"aad").unwrap();
        assert_eq!(pt, b"plaintext");
    }

    #[test]
    fn aead_rejects_tampered_ciphertext() {
        let key = [1u8; AES256_KEY_LEN];
        let nonce = [2u8; AES256_NONCE_LEN];
        let mut ct = aes256_gcm_encrypt(&key, &nonce, b"plaintext", b"aad").unwrap();
        ct[0] ^= 0xFF;
        assert!(aes256_gcm_decrypt(&key, &nonce, &ct, b"aad").is_err());
    }
}
