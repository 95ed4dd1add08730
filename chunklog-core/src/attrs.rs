//! Attribute multimap codec: `count(u16) | [keyID(u16), valLen(u16), valBytes]*`.
//!
//! Encoding is always performed against a chunk's [`crate::dictionary::Dictionary`].

use crate::dictionary::Dictionary;
use crate::error::ChunkManagerError;
use crate::record::Attrs;

pub const MAX_ENCODED_LEN: usize = 65_535;

/// Size an attribute blob would encode to, without touching a dictionary: a key's *presence* in
/// the dictionary never changes the 2-byte id field's width, so this depends only on `attrs`
/// itself. Used by the rotation hard-limit check and `SizePolicy`, both of which need the
/// projected attribute length before deciding whether this record lands in the active chunk or a
/// freshly rotated one.
pub fn encoded_len(attrs: &Attrs) -> usize {
    2 + attrs.iter().map(|(_, v)| 4 + v.len()).sum::<usize>()
}

/// Encode `attrs` against `dict`, interning any keys seen for the first time.
///
/// Returns the encoded blob plus the list of newly assigned `(key, id)` pairs, in assignment
/// order, so the caller can append the corresponding dictionary entries *before* the blob itself
/// (the dictionary-before-reference durability ordering).
pub fn encode(
    attrs: &Attrs,
    dict: &mut Dictionary,
) -> Result<(Vec<u8>, Vec<String>), ChunkManagerError> {
    let mut new_keys = Vec::new();
    let mut ids = Vec::with_capacity(attrs.len());

    for (key, _) in attrs {
        let (id, fresh) = dict.intern(key);
        ids.push(id);
        if fresh {
            new_keys.push(key.clone());
        }
    }

    if attrs.len() > u16::MAX as usize {
        return Err(ChunkManagerError::AttrTooLarge);
    }

    let mut buf = Vec::new();
    buf.extend_from_slice(&(attrs.len() as u16).to_le_bytes());

    for ((_, value), id) in attrs.iter().zip(ids) {
        let value_bytes = value.as_bytes();
        if value_bytes.len() > u16::MAX as usize {
            return Err(ChunkManagerError::AttrTooLarge);
        }
        buf.extend_from_slice(&id.to_le_bytes());
        buf.extend_from_slice(&(value_bytes.len() as u16).to_le_bytes());
        buf.extend_from_slice(value_bytes);
    }

    if buf.len() > MAX_ENCODED_LEN {
        return Err(ChunkManagerError::AttrTooLarge);
    }

    Ok((buf, new_keys))
}

/// Decode an attribute blob using the fully loaded dictionary of the chunk it came from.
pub fn decode(blob: &[u8], dict: &Dictionary) -> anyhow::Result<Attrs> {
    if blob.len() < 2 {
        anyhow::bail!("attribute blob shorter than its count prefix");
    }

    let count = u16::from_le_bytes(blob[0..2].try_into().unwrap()) as usize;
    let mut pos = 2usize;
    let mut attrs = Vec::with_capacity(count);

    for _ in 0..count {
        if pos + 4 > blob.len() {
            anyhow::bail!("truncated attribute entry header");
        }
        let key_id = u16::from_le_bytes(blob[pos..pos + 2].try_into().unwrap());
        let val_len = u16::from_le_bytes(blob[pos + 2..pos + 4].try_into().unwrap()) as usize;
        pos += 4;

        if pos + val_len > blob.len() {
            anyhow::bail!("truncated attribute value");
        }
        let value = std::str::from_utf8(&blob[pos..pos + val_len])?.to_owned();
        pos += val_len;

        let key = dict
            .key(key_id)
            .ok_or_else(|| anyhow::anyhow!("attribute references unknown dictionary key {key_id}"))?
            .to_owned();

        attrs.push((key, value));
    }

    Ok(attrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn round_trips_for_arbitrary_attrs(
            attrs in proptest::collection::vec(("[a-z]{1,8}", "[a-zA-Z0-9]{0,16}"), 0..8)
        ) {
            let mut dict = Dictionary::new();
            let (blob, _) = encode(&attrs, &mut dict).unwrap();
            let decoded = decode(&blob, &dict).unwrap();
            prop_assert_eq!(decoded, attrs);
        }
    }

    #[test]
    fn round_trips_through_dictionary() {
        let mut dict = Dictionary::new();
        let attrs: Attrs = vec![
            ("host".to_owned(), "a1".to_owned()),
            ("service".to_owned(), "ingest".to_owned()),
        ];

        let (blob, new_keys) = encode(&attrs, &mut dict).unwrap();
        assert_eq!(new_keys, vec!["host".to_owned(), "service".to_owned()]);

        let decoded = decode(&blob, &dict).unwrap();
        assert_eq!(decoded, attrs);
    }

    #[test]
    fn repeated_keys_are_interned_once() {
        let mut dict = Dictionary::new();
        let attrs: Attrs = vec![
            ("host".to_owned(), "a1".to_owned()),
            ("host".to_owned(), "a2".to_owned()),
        ];

        let (_, new_keys) = encode(&attrs, &mut dict).unwrap();
        assert_eq!(new_keys, vec!["host".to_owned()]);
        assert_eq!(dict.len(), 1);
    }

    #[test]
    fn empty_attrs_encode_to_count_zero() {
        let mut dict = Dictionary::new();
        let (blob, new_keys) = encode(&Attrs::new(), &mut dict).unwrap();
        assert_eq!(blob, 0u16.to_le_bytes());
        assert!(new_keys.is_empty());
        assert_eq!(decode(&blob, &dict).unwrap(), Attrs::new());
    }

    #[test]
    fn decode_rejects_unknown_key_id() {
        let dict = Dictionary::new();
        let mut blob = 1u16.to_le_bytes().to_vec();
        blob.extend_from_slice(&0u16.to_le_bytes()); // key id 0, never interned
        blob.extend_from_slice(&0u16.to_le_bytes()); // empty value
        assert!(decode(&blob, &dict).is_err());
    }
}
