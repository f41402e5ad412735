//! Versioned value envelopes.
//!
//! Every value blob starts with a one-byte schema tag followed by the JSON
//! body. Readers match on the tag: older tags are upgraded at read time by
//! the owning store, a newer tag is an [`DbError::UnsupportedVersion`]
//! error, never a silent misread.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::DbError;

/// A decoded envelope borrowing the raw blob.
#[derive(Debug, Clone, Copy)]
pub struct Envelope<'a> {
    pub tag: u8,
    pub body: &'a [u8],
}

/// Serialises `value` under the given schema tag.
///
/// # Errors
///
/// Returns `DbError::Serialization` if the value cannot be serialised.
pub fn encode_value<T: Serialize>(tag: u8, value: &T) -> Result<Vec<u8>, DbError> {
    let body = serde_json::to_vec(value)?;
    let mut blob = Vec::with_capacity(body.len() + 1);
    blob.push(tag);
    blob.extend_from_slice(&body);
    Ok(blob)
}

/// Splits a blob into tag and body.
///
/// # Errors
///
/// Returns `DbError::Corrupt` on an empty blob.
pub fn decode_envelope(blob: &[u8]) -> Result<Envelope<'_>, DbError> {
    match blob.split_first() {
        Some((tag, body)) => Ok(Envelope { tag: *tag, body }),
        None => Err(DbError::Corrupt("empty value blob".to_string())),
    }
}

/// Deserialises an envelope body.
pub fn decode_body<T: DeserializeOwned>(env: Envelope<'_>) -> Result<T, DbError> {
    Ok(serde_json::from_slice(env.body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let blob = encode_value(1, &vec![1u32, 2, 3]).unwrap();
        let env = decode_envelope(&blob).unwrap();
        assert_eq!(env.tag, 1);
        let v: Vec<u32> = decode_body(env).unwrap();
        assert_eq!(v, vec![1, 2, 3]);
    }

    #[test]
    fn empty_blob_is_corrupt() {
        assert!(matches!(decode_envelope(&[]), Err(DbError::Corrupt(_))));
    }
}
