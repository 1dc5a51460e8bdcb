//! Long-term identity and pre-key management (§4.3).
//!
//! [`LocalIdentity`] is the locally owned keypair-and-prekey-store record.
//! [`RemoteIdentity`] is what a peer publishes about itself, admitted only
//! after its signature verifies. [`crate::codec::Identity`] is the wire
//! framing of the signing/exchange key pair embedded inside a bundle or
//! message; `LocalIdentity::public_block` and `RemoteIdentity::from_wire`
//! are the bridge between the two.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use log::info;

use crate::codec::{self, WireRecord};
use crate::error::IdentityError;
use crate::primitives::{Ed25519KeyPair, Ed25519Pub, X25519Pub, X25519SecretKey};

/// One signed pre-key: an X25519 keypair plus an Ed25519 signature over its
/// public bytes, made by the owning identity's signing key.
pub struct SignedPreKey {
    pub id: u32,
    pub secret: X25519SecretKey,
    pub signature: [u8; 64],
}

impl SignedPreKey {
    pub fn public(&self) -> X25519Pub {
        self.secret.public()
    }
}

/// One one-time pre-key: consumed at most once (§3 invariant).
pub struct OneTimePreKey {
    pub id: u32,
    pub secret: X25519SecretKey,
}

/// A locally owned identity: long-term signing and exchange keys plus the
/// pre-key pools bundles are assembled from.
pub struct LocalIdentity {
    pub registration_id: u32,
    signing: Ed25519KeyPair,
    exchange: X25519SecretKey,
    created_at: DateTime<Utc>,
    one_time_pre_keys: BTreeMap<u32, OneTimePreKey>,
    signed_pre_keys: BTreeMap<u32, SignedPreKey>,
    next_one_time_id: u32,
    next_signed_id: u32,
}

impl LocalIdentity {
    /// Generates a fresh identity with `k` one-time pre-keys and `m` signed
    /// pre-keys pre-allocated.
    pub fn generate(registration_id: u32, k: u32, m: u32) -> Self {
        let mut identity = LocalIdentity {
            registration_id,
            signing: Ed25519KeyPair::generate(),
            exchange: X25519SecretKey::generate(),
            created_at: Utc::now(),
            one_time_pre_keys: BTreeMap::new(),
            signed_pre_keys: BTreeMap::new(),
            next_one_time_id: 0,
            next_signed_id: 0,
        };
        for _ in 0..k {
            identity.add_one_time_pre_key();
        }
        for _ in 0..m {
            identity.add_signed_pre_key();
        }
        identity
    }

    pub fn add_one_time_pre_key(&mut self) -> u32 {
        let id = self.next_one_time_id;
        self.next_one_time_id += 1;
        self.one_time_pre_keys.insert(
            id,
            OneTimePreKey {
                id,
                secret: X25519SecretKey::generate(),
            },
        );
        id
    }

    pub fn add_signed_pre_key(&mut self) -> u32 {
        let id = self.next_signed_id;
        self.next_signed_id += 1;
        let secret = X25519SecretKey::generate();
        let signature = self.signing.sign(&secret.public().0);
        self.signed_pre_keys.insert(
            id,
            SignedPreKey {
                id,
                secret,
                signature,
            },
        );
        id
    }

    pub fn signing_public(&self) -> Ed25519Pub {
        self.signing.public()
    }

    pub fn exchange_public(&self) -> X25519Pub {
        self.exchange.public()
    }

    pub fn exchange_secret(&self) -> &X25519SecretKey {
        &self.exchange
    }

    pub fn one_time_pre_key_count(&self) -> usize {
        self.one_time_pre_keys.len()
    }

    pub fn signed_pre_key(&self, id: u32) -> Option<&SignedPreKey> {
        self.signed_pre_keys.get(&id)
    }

    pub fn latest_signed_pre_key(&self) -> Option<&SignedPreKey> {
        self.signed_pre_keys.values().next_back()
    }

    /// Consumes one-time pre-key `id`. A second consumption of the same id
    /// yields [`IdentityError::UnknownPreKey`], matching the §3 invariant.
    pub fn take_one_time_pre_key(&mut self, id: u32) -> Result<OneTimePreKey, IdentityError> {
        self.one_time_pre_keys
            .remove(&id)
            .inspect(|_| info!("consumed one-time pre-key {id}"))
            .ok_or(IdentityError::UnknownPreKey(id))
    }

    /// Signs the wire serialization of the exchange key, per §4.3.
    pub fn sign_exchange_key(&self) -> Vec<u8> {
        self.signing.sign(&self.exchange_public().0).to_vec()
    }

    /// The wire `Identity` block this identity presents to peers.
    pub fn public_block(&self) -> codec::Identity {
        codec::Identity {
            version: codec::CURRENT_VERSION,
            signing_key: self.signing_public(),
            exchange_key: self.exchange_public(),
            signature: self.sign_exchange_key(),
            created_at: self.created_at,
        }
    }

    /// Assembles a [`codec::PreKeyBundle`] from the identity's latest signed
    /// pre-key and, if present, one unconsumed one-time pre-key.
    pub fn assemble_bundle(&self, one_time_pre_key_id: Option<u32>) -> Option<codec::PreKeyBundle> {
        let spk = self.latest_signed_pre_key()?;
        let pre_key = one_time_pre_key_id.and_then(|id| {
            self.one_time_pre_keys.get(&id).map(|otpk| codec::PreKey {
                version: codec::CURRENT_VERSION,
                id: otpk.id,
                key: otpk.secret.public(),
            })
        });
        Some(codec::PreKeyBundle {
            version: codec::CURRENT_VERSION,
            registration_id: self.registration_id,
            identity: self.public_block(),
            pre_key,
            pre_key_signed: codec::PreKeySigned {
                version: codec::CURRENT_VERSION,
                id: spk.id,
                key: spk.public(),
                signature: spk.signature.to_vec(),
            },
        })
    }
}

/// A peer's identity, admitted into a session only after `verify` succeeds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteIdentity {
    pub signing_key: Ed25519Pub,
    pub exchange_key: X25519Pub,
    pub registration_id: u32,
}

impl RemoteIdentity {
    /// Verifies the wire `Identity` block's signature (§3 invariant) and, if
    /// it verifies, returns the admitted `RemoteIdentity`.
    pub fn from_wire(block: &codec::Identity, registration_id: u32) -> Result<Self, IdentityError> {
        let sig: [u8; 64] = block
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::BadSignature)?;
        if !block.signing_key.verify(&block.exchange_key.0, &sig) {
            return Err(IdentityError::BadSignature);
        }
        Ok(RemoteIdentity {
            signing_key: block.signing_key,
            exchange_key: block.exchange_key,
            registration_id,
        })
    }
}

/// Verifies a bundle's signed pre-key signature under the bundle's identity
/// signing key, per the §3 `PreKeyBundle` invariant.
pub fn verify_signed_pre_key(
    identity: &RemoteIdentity,
    signed_pre_key: &codec::PreKeySigned,
) -> Result<(), IdentityError> {
    let sig: [u8; 64] = signed_pre_key
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| IdentityError::BadSignature)?;
    if identity.signing_key.verify(&signed_pre_key.key.0, &sig) {
        Ok(())
    } else {
        Err(IdentityError::BadSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_assembly_and_identity_verification() {
        let identity = LocalIdentity::generate(1, 1, 1);
        let bundle = identity.assemble_bundle(Some(0)).unwrap();
        let remote = RemoteIdentity::from_wire(&bundle.identity, bundle.registration_id).unwrap();
        verify_signed_pre_key(&remote, &bundle.pre_key_signed).unwrap();
    }

    #[test]
    fn one_time_pre_key_consumed_at_most_once() {
        let mut identity = LocalIdentity::generate(1, 1, 0);
        assert_eq!(identity.one_time_pre_key_count(), 1);
        identity.take_one_time_pre_key(0).unwrap();
        assert_eq!(identity.one_time_pre_key_count(), 0);
        assert!(matches!(
            identity.take_one_time_pre_key(0),
            Err(IdentityError::UnknownPreKey(0))
        ));
    }

    #[test]
    fn tampered_identity_signature_is_rejected() {
        let identity = LocalIdentity::generate(1, 0, 1);
        let mut block = identity.public_block();
        block.signature[0] ^= 0xFF;
        assert!(RemoteIdentity::from_wire(&block, 1).is_err());
    }
}
