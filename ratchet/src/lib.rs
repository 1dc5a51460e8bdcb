//! A Double Ratchet / X3DH secure-messaging core: X3DH handshake, the
//! combined DH/symmetric ratchet, a bounded skipped-message-key cache, and a
//! deterministic wire codec, behind a single [`session::Session`] façade.

pub mod cache;
pub mod chain;
pub mod codec;
pub mod config;
pub mod dh;
pub mod error;
pub mod identity;
pub mod primitives;
pub mod session;
pub mod x3dh;

pub use config::RatchetConfig;
pub use error::SessionError;
pub use identity::{LocalIdentity, RemoteIdentity};
pub use session::{OutboundMessage, Session, SkippedStats};
