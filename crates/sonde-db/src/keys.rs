//! Order-preserving binary key encodings.
//!
//! Keys compare as raw byte strings inside SQLite, so every component is
//! written big-endian with the sign bit flipped: byte order then equals
//! numeric order across the full signed range. Composite keys concatenate
//! fixed-width components, which keeps prefixes meaningful for range scans.

use sonde_types::{InternalId, Timestamp};

use crate::error::DbError;

const SIGN: u64 = 1 << 63;

/// Appends a signed 64-bit component.
pub fn push_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&((v as u64) ^ SIGN).to_be_bytes());
}

/// Reads the signed 64-bit component at byte offset `off`.
///
/// # Errors
///
/// Returns `DbError::Corrupt` when the slice is too short.
pub fn read_i64(key: &[u8], off: usize) -> Result<i64, DbError> {
    let end = off
        .checked_add(8)
        .filter(|end| *end <= key.len())
        .ok_or_else(|| DbError::Corrupt(format!("key too short for component at {off}")))?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&key[off..end]);
    Ok((u64::from_be_bytes(raw) ^ SIGN) as i64)
}

/// `(internal_id, valid_time)` — the feature version key.
pub fn feature_key(id: InternalId, valid_time: Timestamp) -> Vec<u8> {
    let mut k = Vec::with_capacity(16);
    push_i64(&mut k, id);
    push_i64(&mut k, valid_time.millis());
    k
}

pub fn split_feature_key(key: &[u8]) -> Result<(InternalId, Timestamp), DbError> {
    Ok((read_i64(key, 0)?, Timestamp(read_i64(key, 8)?)))
}

/// `(series_id, phenomenon_time)` — the primary observation key.
pub fn obs_key(series_id: InternalId, phenomenon_time: Timestamp) -> Vec<u8> {
    let mut k = Vec::with_capacity(16);
    push_i64(&mut k, series_id);
    push_i64(&mut k, phenomenon_time.millis());
    k
}

pub fn split_obs_key(key: &[u8]) -> Result<(InternalId, Timestamp), DbError> {
    Ok((read_i64(key, 0)?, Timestamp(read_i64(key, 8)?)))
}

/// `(data_stream_id, result_time, foi_id)` — the series lookup key.
pub fn series_ds_key(
    data_stream_id: InternalId,
    result_time: Timestamp,
    foi_id: InternalId,
) -> Vec<u8> {
    let mut k = Vec::with_capacity(24);
    push_i64(&mut k, data_stream_id);
    push_i64(&mut k, result_time.millis());
    push_i64(&mut k, foi_id);
    k
}

pub fn split_series_ds_key(key: &[u8]) -> Result<(InternalId, Timestamp, InternalId), DbError> {
    Ok((
        read_i64(key, 0)?,
        Timestamp(read_i64(key, 8)?),
        read_i64(key, 16)?,
    ))
}

/// A bare internal-ID key.
pub fn id_key(id: InternalId) -> Vec<u8> {
    let mut k = Vec::with_capacity(8);
    push_i64(&mut k, id);
    k
}

/// A textual unique-ID key for the UID lookup maps.
pub fn uid_key(uid: &str) -> Vec<u8> {
    uid.as_bytes().to_vec()
}

/// The smallest key strictly greater than every key starting with
/// `prefix`, for use as an exclusive range upper bound. `None` means the
/// range is unbounded above (all-0xFF prefix).
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return Some(end);
        }
        end.pop();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i64_encoding_preserves_order() {
        let values = [i64::MIN, -1_000_000, -1, 0, 1, 42, 1 << 40, i64::MAX];
        let mut encoded: Vec<Vec<u8>> = values
            .iter()
            .map(|v| {
                let mut k = Vec::new();
                push_i64(&mut k, *v);
                k
            })
            .collect();
        let sorted = encoded.clone();
        encoded.sort();
        assert_eq!(encoded, sorted, "byte order must equal numeric order");
        for (v, k) in values.iter().zip(&encoded) {
            assert_eq!(read_i64(k, 0).unwrap(), *v);
        }
    }

    #[test]
    fn composite_keys_round_trip() {
        let k = feature_key(7, Timestamp(-5));
        assert_eq!(split_feature_key(&k).unwrap(), (7, Timestamp(-5)));

        let k = series_ds_key(3, Timestamp(99), 12);
        assert_eq!(split_series_ds_key(&k).unwrap(), (3, Timestamp(99), 12));
    }

    #[test]
    fn feature_keys_order_by_id_then_time() {
        let a = feature_key(1, Timestamp::MAX);
        let b = feature_key(2, Timestamp::MIN);
        assert!(a < b, "all versions of id 1 precede id 2");

        let c = feature_key(2, Timestamp(10));
        let d = feature_key(2, Timestamp(20));
        assert!(c < d);
    }

    #[test]
    fn prefix_end_bounds_a_prefix_scan() {
        let prefix = id_key(5);
        let end = prefix_end(&prefix).unwrap();
        let inside = feature_key(5, Timestamp::MAX);
        let outside = feature_key(6, Timestamp::MIN);
        assert!(prefix.as_slice() <= inside.as_slice() && inside < end);
        assert!(outside >= end);

        assert_eq!(prefix_end(&[0xFF, 0xFF]), None);
        assert_eq!(prefix_end(&[0x01, 0xFF]), Some(vec![0x02]));
    }

    #[test]
    fn short_key_is_corrupt() {
        assert!(matches!(read_i64(&[0, 1, 2], 0), Err(DbError::Corrupt(_))));
    }
}
