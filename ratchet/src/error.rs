//! Error taxonomy: one narrow enum per component, all convertible into
//! [`SessionError`], the only error type the façade returns to callers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("required field {0} missing")]
    MissingField(u32),
    #[error("field {0} has wrong length: expected {1}, got {2}")]
    WrongLength(u32, usize, usize),
    #[error("record truncated while reading field header")]
    Truncated,
    #[error("invalid UTF-8 in string field {0}")]
    InvalidUtf8(u32),
    #[error("invalid date in field {0}: {1}")]
    InvalidDate(u32, String),
    #[error("invalid curve point in field {0}")]
    InvalidCurvePoint(u32),
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity signature does not verify")]
    BadSignature,
    #[error("one-time pre-key {0} is unknown or already consumed")]
    UnknownPreKey(u32),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Error)]
pub enum X3dhError {
    #[error("peer identity signature does not verify")]
    BadIdentitySignature,
    #[error("signed pre-key signature does not verify")]
    BadSignedPreKeySignature,
    #[error("one-time pre-key {0} is unknown or already consumed")]
    UnknownPreKey(u32),
    #[error(transparent)]
    Hkdf(#[from] hkdf::InvalidLength),
}

#[derive(Debug, Error)]
pub enum RatchetError {
    #[error("AEAD decryption failed")]
    DecryptFailed,
    #[error("MessageSigned MAC does not verify")]
    MacMismatch,
    #[error("message counter {0} lies outside the retained ratchet window")]
    OutsideWindow(u32),
    #[error("message counter {0} was already decrypted")]
    Duplicate(u32),
    #[error(transparent)]
    Hkdf(#[from] hkdf::InvalidLength),
    #[error(transparent)]
    Aead(#[from] aes_gcm::Error),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("skipped-key cache is exhausted")]
    Exhausted,
}

/// The single error type returned by every [`crate::session::Session`] operation.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("malformed message: {0}")]
    MalformedMessage(#[from] CodecError),
    #[error("bad identity: {0}")]
    BadIdentity(String),
    #[error("unknown pre-key {0}")]
    UnknownPreKey(u32),
    #[error("message outside ratchet window (counter {0})")]
    MessageOutsideRatchetWindow(u32),
    #[error("duplicate message (counter {0})")]
    DuplicateMessage(u32),
    #[error("decrypt failed")]
    DecryptFailed,
    #[error("skipped-key cache exhausted")]
    CacheExhausted,
    #[error("crypto engine unavailable")]
    EngineUnavailable,
}

impl From<IdentityError> for SessionError {
    fn from(e: IdentityError) -> Self {
        match e {
            IdentityError::BadSignature => SessionError::BadIdentity(e.to_string()),
            IdentityError::UnknownPreKey(id) => SessionError::UnknownPreKey(id),
            IdentityError::Codec(c) => SessionError::MalformedMessage(c),
        }
    }
}

impl From<X3dhError> for SessionError {
    fn from(e: X3dhError) -> Self {
        match e {
            X3dhError::BadIdentitySignature | X3dhError::BadSignedPreKeySignature => {
                SessionError::BadIdentity(e.to_string())
            }
            X3dhError::UnknownPreKey(id) => SessionError::UnknownPreKey(id),
            X3dhError::Hkdf(_) => SessionError::EngineUnavailable,
        }
    }
}

impl From<RatchetError> for SessionError {
    fn from(e: RatchetError) -> Self {
        match e {
            RatchetError::DecryptFailed | RatchetError::MacMismatch => SessionError::DecryptFailed,
            RatchetError::OutsideWindow(c) => SessionError::MessageOutsideRatchetWindow(c),
            RatchetError::Duplicate(c) => SessionError::DuplicateMessage(c),
            RatchetError::Hkdf(_) | RatchetError::Aead(_) => SessionError::DecryptFailed,
        }
    }
}

impl From<CacheError> for SessionError {
    fn from(_: CacheError) -> Self {
        SessionError::CacheExhausted
    }
}
