//! Deterministic, self-describing binary framing.
//!
//! A record is fields sorted by ascending numeric id, each framed as
//! `field_id: u32 LE, length: u32 LE, value: length bytes`. The low-level
//! engine (`encode_fields`/`decode_fields`) is the single generic codec
//! every record type is built on; each record type supplies its own
//! typed field table rather than relying on reflection.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::error::CodecError;
use crate::primitives::{Ed25519Pub, X25519Pub, ED25519_PUBLIC_LEN, X25519_LEN};

pub type FieldMap = BTreeMap<u32, Vec<u8>>;

/// Concatenate fields in strictly increasing id order. Accepts fields in
/// any order and sorts them, so callers never have to think about order.
pub fn encode_fields(fields: &[(u32, Vec<u8>)]) -> Vec<u8> {
    let mut sorted: Vec<&(u32, Vec<u8>)> = fields.iter().collect();
    sorted.sort_by_key(|(id, _)| *id);
    let mut out = Vec::new();
    for (id, value) in sorted {
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&(value.len() as u32).to_le_bytes());
        out.extend_from_slice(value);
    }
    out
}

/// Parse a byte string into its field map. Does not know about required
/// fields; that validation happens per record type in terms of the typed
/// field table.
pub fn decode_fields(data: &[u8]) -> Result<FieldMap, CodecError> {
    let mut map = FieldMap::new();
    let mut pos = 0usize;
    while pos < data.len() {
        if pos + 8 > data.len() {
            return Err(CodecError::Truncated);
        }
        let id = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
        let len = u32::from_le_bytes(data[pos + 4..pos + 8].try_into().unwrap()) as usize;
        pos += 8;
        if pos + len > data.len() {
            return Err(CodecError::Truncated);
        }
        // last writer wins if a field id repeats; unknown ids are kept here
        // and simply never read by a typed accessor, satisfying "skip".
        map.insert(id, data[pos..pos + len].to_vec());
        pos += len;
    }
    Ok(map)
}

pub fn require<'a>(fields: &'a FieldMap, id: u32) -> Result<&'a [u8], CodecError> {
    fields.get(&id).map(|v| v.as_slice()).ok_or(CodecError::MissingField(id))
}

pub fn encode_uint32(v: u32) -> Vec<u8> {
    v.to_le_bytes().to_vec()
}

pub fn decode_uint32(bytes: &[u8], id: u32) -> Result<u32, CodecError> {
    let arr: [u8; 4] = bytes
        .try_into()
        .map_err(|_| CodecError::WrongLength(id, 4, bytes.len()))?;
    Ok(u32::from_le_bytes(arr))
}

pub fn decode_uint32_or(fields: &FieldMap, id: u32, default: u32) -> Result<u32, CodecError> {
    match fields.get(&id) {
        Some(b) => decode_uint32(b, id),
        None => Ok(default),
    }
}

pub fn encode_x25519(pk: &X25519Pub) -> Vec<u8> {
    pk.0.to_vec()
}

pub fn decode_x25519(bytes: &[u8], id: u32) -> Result<X25519Pub, CodecError> {
    let arr: [u8; X25519_LEN] = bytes
        .try_into()
        .map_err(|_| CodecError::InvalidCurvePoint(id))?;
    Ok(X25519Pub(arr))
}

pub fn encode_ed25519(pk: &Ed25519Pub) -> Vec<u8> {
    pk.0.to_vec()
}

pub fn decode_ed25519(bytes: &[u8], id: u32) -> Result<Ed25519Pub, CodecError> {
    let arr: [u8; ED25519_PUBLIC_LEN] = bytes
        .try_into()
        .map_err(|_| CodecError::InvalidCurvePoint(id))?;
    Ok(Ed25519Pub(arr))
}

pub fn encode_date(dt: &DateTime<Utc>) -> Vec<u8> {
    dt.to_rfc3339().into_bytes()
}

pub fn decode_date(bytes: &[u8], id: u32) -> Result<DateTime<Utc>, CodecError> {
    let s = String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8(id))?;
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| CodecError::InvalidDate(id, e.to_string()))
}

/// A record that can round-trip through the TLV engine.
pub trait WireRecord: Sized {
    fn encode(&self) -> Vec<u8>;
    fn decode(data: &[u8]) -> Result<Self, CodecError>;
}

/// Field id 0, `version`, shared by every top-level record; defaults to 1.
pub const VERSION_FIELD: u32 = 0;
pub const CURRENT_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub version: u32,
    pub signing_key: Ed25519Pub,
    pub exchange_key: X25519Pub,
    pub signature: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl WireRecord for Identity {
    fn encode(&self) -> Vec<u8> {
        encode_fields(&[
            (VERSION_FIELD, encode_uint32(self.version)),
            (1, encode_ed25519(&self.signing_key)),
            (2, encode_x25519(&self.exchange_key)),
            (3, self.signature.clone()),
            (4, encode_date(&self.created_at)),
        ])
    }

    fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let f = decode_fields(data)?;
        Ok(Identity {
            version: decode_uint32_or(&f, VERSION_FIELD, CURRENT_VERSION)?,
            signing_key: decode_ed25519(require(&f, 1)?, 1)?,
            exchange_key: decode_x25519(require(&f, 2)?, 2)?,
            signature: require(&f, 3)?.to_vec(),
            created_at: decode_date(require(&f, 4)?, 4)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreKey {
    pub version: u32,
    pub id: u32,
    pub key: X25519Pub,
}

impl WireRecord for PreKey {
    fn encode(&self) -> Vec<u8> {
        encode_fields(&[
            (VERSION_FIELD, encode_uint32(self.version)),
            (1, encode_uint32(self.id)),
            (2, encode_x25519(&self.key)),
        ])
    }

    fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let f = decode_fields(data)?;
        Ok(PreKey {
            version: decode_uint32_or(&f, VERSION_FIELD, CURRENT_VERSION)?,
            id: decode_uint32(require(&f, 1)?, 1)?,
            key: decode_x25519(require(&f, 2)?, 2)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreKeySigned {
    pub version: u32,
    pub id: u32,
    pub key: X25519Pub,
    pub signature: Vec<u8>,
}

impl WireRecord for PreKeySigned {
    fn encode(&self) -> Vec<u8> {
        encode_fields(&[
            (VERSION_FIELD, encode_uint32(self.version)),
            (1, encode_uint32(self.id)),
            (2, encode_x25519(&self.key)),
            (3, self.signature.clone()),
        ])
    }

    fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let f = decode_fields(data)?;
        Ok(PreKeySigned {
            version: decode_uint32_or(&f, VERSION_FIELD, CURRENT_VERSION)?,
            id: decode_uint32(require(&f, 1)?, 1)?,
            key: decode_x25519(require(&f, 2)?, 2)?,
            signature: require(&f, 3)?.to_vec(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreKeyBundle {
    pub version: u32,
    pub registration_id: u32,
    pub identity: Identity,
    pub pre_key: Option<PreKey>,
    pub pre_key_signed: PreKeySigned,
}

impl WireRecord for PreKeyBundle {
    fn encode(&self) -> Vec<u8> {
        let mut fields = vec![
            (VERSION_FIELD, encode_uint32(self.version)),
            (1, encode_uint32(self.registration_id)),
            (2, self.identity.encode()),
            (4, self.pre_key_signed.encode()),
        ];
        if let Some(pk) = &self.pre_key {
            fields.push((3, pk.encode()));
        }
        encode_fields(&fields)
    }

    fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let f = decode_fields(data)?;
        Ok(PreKeyBundle {
            version: decode_uint32_or(&f, VERSION_FIELD, CURRENT_VERSION)?,
            registration_id: decode_uint32(require(&f, 1)?, 1)?,
            identity: Identity::decode(require(&f, 2)?)?,
            pre_key: match f.get(&3) {
                Some(b) => Some(PreKey::decode(b)?),
                None => None,
            },
            pre_key_signed: PreKeySigned::decode(require(&f, 4)?)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub version: u32,
    pub sender_ratchet_key: X25519Pub,
    pub counter: u32,
    pub previous_counter: u32,
    pub cipher_text: Vec<u8>,
}

impl WireRecord for Message {
    fn encode(&self) -> Vec<u8> {
        encode_fields(&[
            (VERSION_FIELD, encode_uint32(self.version)),
            (1, encode_x25519(&self.sender_ratchet_key)),
            (2, encode_uint32(self.counter)),
            (3, encode_uint32(self.previous_counter)),
            (4, self.cipher_text.clone()),
        ])
    }

    fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let f = decode_fields(data)?;
        Ok(Message {
            version: decode_uint32_or(&f, VERSION_FIELD, CURRENT_VERSION)?,
            sender_ratchet_key: decode_x25519(require(&f, 1)?, 1)?,
            counter: decode_uint32(require(&f, 2)?, 2)?,
            previous_counter: decode_uint32(require(&f, 3)?, 3)?,
            cipher_text: require(&f, 4)?.to_vec(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageSigned {
    pub version: u32,
    pub sender_key: Ed25519Pub,
    pub message: Message,
    pub signature: Vec<u8>,
}

impl WireRecord for MessageSigned {
    fn encode(&self) -> Vec<u8> {
        encode_fields(&[
            (VERSION_FIELD, encode_uint32(self.version)),
            (1, encode_ed25519(&self.sender_key)),
            (2, self.message.encode()),
            (3, self.signature.clone()),
        ])
    }

    fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let f = decode_fields(data)?;
        Ok(MessageSigned {
            version: decode_uint32_or(&f, VERSION_FIELD, CURRENT_VERSION)?,
            sender_key: decode_ed25519(require(&f, 1)?, 1)?,
            message: Message::decode(require(&f, 2)?)?,
            signature: require(&f, 3)?.to_vec(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreKeyMessage {
    pub version: u32,
    pub registration_id: u32,
    pub pre_key_id: Option<u32>,
    pub pre_key_signed_id: u32,
    pub base_key: X25519Pub,
    pub identity: Identity,
    pub signed_message: MessageSigned,
}

impl WireRecord for PreKeyMessage {
    fn encode(&self) -> Vec<u8> {
        let mut fields = vec![
            (VERSION_FIELD, encode_uint32(self.version)),
            (1, encode_uint32(self.registration_id)),
            (3, encode_uint32(self.pre_key_signed_id)),
            (4, encode_x25519(&self.base_key)),
            (5, self.identity.encode()),
            (6, self.signed_message.encode()),
        ];
        if let Some(id) = self.pre_key_id {
            fields.push((2, encode_uint32(id)));
        }
        encode_fields(&fields)
    }

    fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let f = decode_fields(data)?;
        Ok(PreKeyMessage {
            version: decode_uint32_or(&f, VERSION_FIELD, CURRENT_VERSION)?,
            registration_id: decode_uint32(require(&f, 1)?, 1)?,
            pre_key_id: match f.get(&2) {
                Some(b) => Some(decode_uint32(b, 2)?),
                None => None,
            },
            pre_key_signed_id: decode_uint32(require(&f, 3)?, 3)?,
            base_key: decode_x25519(require(&f, 4)?, 4)?,
            identity: Identity::decode(require(&f, 5)?)?,
            signed_message: MessageSigned::decode(require(&f, 6)?)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{Ed25519KeyPair, X25519SecretKey};

    fn sample_identity() -> Identity {
        let signing = Ed25519KeyPair::generate();
        let exchange = X25519SecretKey::generate();
        Identity {
            version: CURRENT_VERSION,
            signing_key: signing.public(),
            exchange_key: exchange.public(),
            signature: signing.sign(&exchange.public().0).to_vec(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn identity_roundtrips() {
        let id = sample_identity();
        let decoded = Identity::decode(&id.encode()).unwrap();
        assert_eq!(id, decoded);
    }

    #[test]
    fn prekey_bundle_roundtrips_with_and_without_otpk() {
        let bundle_no_otpk = PreKeyBundle {
            version: CURRENT_VERSION,
            registration_id: 42,
            identity: sample_identity(),
            pre_key: None,
            pre_key_signed: PreKeySigned {
                version: CURRENT_VERSION,
                id: 1,
                key: X25519SecretKey::generate().public(),
                signature: vec![9; 64],
            },
        };
        let decoded = PreKeyBundle::decode(&bundle_no_otpk.encode()).unwrap();
        assert_eq!(bundle_no_otpk, decoded);

        let mut bundle_with_otpk = bundle_no_otpk.clone();
        bundle_with_otpk.pre_key = Some(PreKey {
            version: CURRENT_VERSION,
            id: 7,
            key: X25519SecretKey::generate().public(),
        });
        let decoded = PreKeyBundle::decode(&bundle_with_otpk.encode()).unwrap();
        assert_eq!(bundle_with_otpk, decoded);
    }

    #[test]
    fn decode_rejects_missing_required_field() {
        // PreKey encoded without its required `key` field (id 2).
        let data = encode_fields(&[(1, encode_uint32(3))]);
        assert!(matches!(
            PreKey::decode(&data),
            Err(CodecError::MissingField(2))
        ));
    }

    #[test]
    fn decode_skips_unknown_fields() {
        let mut fields = vec![(1, encode_uint32(3)), (99, vec![1, 2, 3])];
        fields.push((2, encode_x25519(&X25519SecretKey::generate().public())));
        let data = encode_fields(&fields);
        let pre_key = PreKey::decode(&data).unwrap();
        assert_eq!(pre_key.id, 3);
    }

    #[test]
    fn fields_are_reordered_to_canonical_form_on_encode() {
        // Build the field list out of order; encode_fields must sort it.
        let out_of_order = encode_fields(&[(2, vec![1]), (0, vec![2]), (1, vec![3])]);
        let canonical = encode_fields(&[(0, vec![2]), (1, vec![3]), (2, vec![1])]);
        assert_eq!(out_of_order, canonical);
    }
}
