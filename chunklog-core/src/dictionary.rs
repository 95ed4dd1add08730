//! Per-chunk append-only string dictionary (`attr_dict.log`).
//!
//! Maps attribute *key* strings to small integer IDs so the attribute blob (`attrs.rs`) can
//! reference keys by a 2-byte ID instead of repeating the string on every record. The assignment
//! `keyID = index_in_file` is implicit in append order, mirroring the way `fixed_index.rs` derives
//! a chunk index position from file offset rather than storing it explicitly.

use std::collections::HashMap;

use crate::file_header::{FileHeader, FileType, HEADER_SIZE};

/// In-memory view of a chunk's key dictionary, plus the encoded bytes of any entries not yet
/// flushed to disk.
#[derive(Default)]
pub struct Dictionary {
    keys: Vec<String>,
    ids: HashMap<String, u16>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn key(&self, id: u16) -> Option<&str> {
        self.keys.get(id as usize).map(String::as_str)
    }

    /// Look up `key`'s id, assigning a fresh one (and returning it alongside `true`) if this is
    /// the first time this chunk has seen `key`.
    pub fn intern(&mut self, key: &str) -> (u16, bool) {
        if let Some(&id) = self.ids.get(key) {
            return (id, false);
        }

        let id = self.keys.len() as u16;
        self.keys.push(key.to_owned());
        self.ids.insert(key.to_owned(), id);
        (id, true)
    }

    /// Encode a single dictionary entry as it is appended to `attr_dict.log`: a `u16` length
    /// prefix followed by the raw key bytes.
    pub fn encode_entry(key: &str) -> Vec<u8> {
        let bytes = key.as_bytes();
        let mut buf = Vec::with_capacity(2 + bytes.len());
        buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
        buf.extend_from_slice(bytes);
        buf
    }

    /// Rebuild a dictionary by scanning `attr_dict.log`'s bytes (header already stripped) linearly
    /// - the crash-recovery path used when reopening a chunk.
    pub fn decode_all(data_section: &[u8]) -> anyhow::Result<Self> {
        let mut dict = Self::new();
        let mut pos = 0usize;

        while pos < data_section.len() {
            if pos + 2 > data_section.len() {
                anyhow::bail!("truncated dictionary entry length prefix");
            }
            let len = u16::from_le_bytes(data_section[pos..pos + 2].try_into().unwrap()) as usize;
            pos += 2;

            if pos + len > data_section.len() {
                anyhow::bail!("truncated dictionary entry body");
            }
            let key = std::str::from_utf8(&data_section[pos..pos + len])?.to_owned();
            pos += len;

            let id = dict.keys.len() as u16;
            dict.ids.insert(key.clone(), id);
            dict.keys.push(key);
        }

        Ok(dict)
    }
}

pub fn new_file_header() -> [u8; HEADER_SIZE] {
    FileHeader::new(FileType::Dict).encode()
}
