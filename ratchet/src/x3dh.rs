//! X3DH handshake (§4.4): both sides derive a 32-byte session root key from
//! up to four Diffie-Hellman outputs.

use log::info;

use crate::codec::{self, WireRecord};
use crate::error::X3dhError;
use crate::identity::{verify_signed_pre_key, LocalIdentity, RemoteIdentity};
use crate::primitives::{hkdf_expand_blocks, X25519Pub, X25519SecretKey};

const PAD: [u8; 32] = [0xFF; 32];
const X3DH_INFO: &[u8] = b"Signal_X3DH";

/// The initiator's ephemeral material and the responder identity it used,
/// kept around only long enough to build the first `PreKeyMessage`.
pub struct InitiatorHandshake {
    pub root_key: [u8; 32],
    /// `EK_A`: also becomes the session's initial ratchet keypair, since its
    /// public half doubles as `PreKeyMessage.base_key` (§4.6).
    pub ephemeral: X25519SecretKey,
    pub remote_identity: RemoteIdentity,
    pub used_one_time_pre_key_id: Option<u32>,
    pub used_signed_pre_key_id: u32,
}

/// Runs the initiator side of X3DH against a freshly fetched bundle.
/// Verifies the bundle's identity signature and signed pre-key signature
/// before computing any Diffie-Hellman output (§4.4 "Before computing
/// X3DH...").
pub fn initiate(
    identity: &LocalIdentity,
    bundle: &codec::PreKeyBundle,
) -> Result<InitiatorHandshake, X3dhError> {
    let remote = RemoteIdentity::from_wire(&bundle.identity, bundle.registration_id)
        .map_err(|_| X3dhError::BadIdentitySignature)?;
    verify_signed_pre_key(&remote, &bundle.pre_key_signed)
        .map_err(|_| X3dhError::BadSignedPreKeySignature)?;

    let ephemeral = X25519SecretKey::generate();
    let ik_a = identity.exchange_secret();
    let spk_b = bundle.pre_key_signed.key;
    let ik_b = remote.exchange_key;

    let dh1 = spk_b.diffie_hellman(ik_a);
    let dh2 = ik_b.diffie_hellman(&ephemeral);
    let dh3 = spk_b.diffie_hellman(&ephemeral);

    let mut km = Vec::with_capacity(32 * 5);
    km.extend_from_slice(&PAD);
    km.extend_from_slice(&dh1);
    km.extend_from_slice(&dh2);
    km.extend_from_slice(&dh3);

    let used_one_time_pre_key_id = bundle.pre_key.as_ref().map(|pk| {
        let dh4 = pk.key.diffie_hellman(&ephemeral);
        km.extend_from_slice(&dh4);
        pk.id
    });

    let root_key = hkdf_expand_blocks(&km, Some(&[0u8; 32]), X3DH_INFO, 1)?[0];
    info!("x3dh initiator handshake complete");

    Ok(InitiatorHandshake {
        root_key,
        ephemeral,
        remote_identity: remote,
        used_one_time_pre_key_id,
        used_signed_pre_key_id: bundle.pre_key_signed.id,
    })
}

/// Runs the responder side of X3DH against an inbound `PreKeyMessage`. The
/// caller is responsible for having already removed the cited one-time
/// pre-key from the identity's pool (via [`LocalIdentity::take_one_time_pre_key`])
/// so double-consumption surfaces as `UnknownPreKey` before this is reached.
pub fn respond(
    identity: &LocalIdentity,
    sender_identity: &RemoteIdentity,
    ephemeral_public: &X25519Pub,
    pre_key_signed_id: u32,
    one_time_pre_key_secret: Option<&X25519SecretKey>,
) -> Result<[u8; 32], X3dhError> {
    let spk = identity
        .signed_pre_key(pre_key_signed_id)
        .ok_or(X3dhError::UnknownPreKey(pre_key_signed_id))?;

    let dh1 = sender_identity.exchange_key.diffie_hellman(&spk.secret);
    let dh2 = ephemeral_public.diffie_hellman(identity.exchange_secret());
    let dh3 = ephemeral_public.diffie_hellman(&spk.secret);

    let mut km = Vec::with_capacity(32 * 5);
    km.extend_from_slice(&PAD);
    km.extend_from_slice(&dh1);
    km.extend_from_slice(&dh2);
    km.extend_from_slice(&dh3);

    if let Some(otpk) = one_time_pre_key_secret {
        let dh4 = ephemeral_public.diffie_hellman(otpk);
        km.extend_from_slice(&dh4);
    }

    let root_key = hkdf_expand_blocks(&km, Some(&[0u8; 32]), X3DH_INFO, 1)?[0];
    info!("x3dh responder handshake complete");
    Ok(root_key)
}
