//! Seekable zstd: independently compressed 256 KiB frames plus a seek table.
//!
//! `data_blob.rs` compresses a whole blob in one `zstd::bulk::compress` call and only ever reads
//! it back in full. Here we need `read_at(offset, len)` on *uncompressed* offsets without
//! decompressing the whole file, so the data section is split into fixed-size frames compressed
//! independently with the same `zstd::bulk` API, and a small seek table (frame compressed
//! lengths) is appended after the data so a reader can locate the covering frame(s) in O(1).

use std::convert::TryInto;

use anyhow::{bail, Context, Error};

pub const FRAME_SIZE: usize = 256 * 1024;
const ZSTD_LEVEL: i32 = 3;

/// Compress `data` (the file's data section, header already stripped) into the seekable format:
/// `[compressed frame 0][compressed frame 1]...[seek table][frame_count: u32][table_offset: u64]`.
///
/// The trailer is read back-to-front by [`read_at`], so frames can be appended in a single
/// forward pass during compression.
pub fn compress_seekable(data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(data.len() / 2);
    let mut frame_lengths: Vec<u32> = Vec::new();

    for chunk in data.chunks(FRAME_SIZE) {
        let compressed = zstd::bulk::compress(chunk, ZSTD_LEVEL)
            .context("failed to compress frame")?;
        frame_lengths.push(compressed.len().try_into().context("frame too large")?);
        out.extend_from_slice(&compressed);
    }

    let table_offset = out.len() as u64;
    for len in &frame_lengths {
        out.extend_from_slice(&len.to_le_bytes());
    }
    out.extend_from_slice(&(frame_lengths.len() as u32).to_le_bytes());
    out.extend_from_slice(&table_offset.to_le_bytes());

    Ok(out)
}

/// Parsed seek table: the compressed offset and length of each frame, plus the uncompressed
/// size of every frame but the last (always [`FRAME_SIZE`]).
pub struct SeekTable<'a> {
    data: &'a [u8],
    frame_offsets: Vec<(u64, u32)>, // (compressed start offset, compressed length)
    uncompressed_len: u64,
}

impl<'a> SeekTable<'a> {
    pub fn parse(data: &'a [u8], uncompressed_len: u64) -> Result<Self, Error> {
        if data.len() < 12 {
            bail!("seekable zstd trailer missing");
        }
        let table_offset =
            u64::from_le_bytes(data[data.len() - 8..].try_into().unwrap()) as usize;
        let frame_count =
            u32::from_le_bytes(data[data.len() - 12..data.len() - 8].try_into().unwrap()) as usize;

        let table_end = data.len() - 12;
        if table_offset > table_end || table_end - table_offset != frame_count * 4 {
            bail!("seekable zstd trailer is inconsistent");
        }

        let mut frame_offsets = Vec::with_capacity(frame_count);
        let mut cursor = 0u64;
        for i in 0..frame_count {
            let pos = table_offset + i * 4;
            let len = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
            frame_offsets.push((cursor, len));
            cursor += len as u64;
        }

        Ok(Self {
            data,
            frame_offsets,
            uncompressed_len,
        })
    }

    /// Decompress exactly the frames covering `[offset, offset+len)` and return the requested
    /// uncompressed slice.
    pub fn read_at(&self, offset: u64, len: u64) -> Result<Vec<u8>, Error> {
        if offset + len > self.uncompressed_len {
            bail!(
                "read_at out of range ({}..{} > {})",
                offset,
                offset + len,
                self.uncompressed_len
            );
        }

        let mut out = Vec::with_capacity(len as usize);
        let mut remaining_start = offset;
        let mut remaining_len = len;

        let first_frame = (offset / FRAME_SIZE as u64) as usize;

        for (idx, (compr_offset, compr_len)) in self.frame_offsets.iter().enumerate().skip(first_frame)
        {
            if remaining_len == 0 {
                break;
            }

            let frame_uncompressed_start = idx as u64 * FRAME_SIZE as u64;
            let frame_uncompressed_len = FRAME_SIZE.min(
                (self.uncompressed_len - frame_uncompressed_start) as usize,
            );

            let compr_bytes =
                &self.data[*compr_offset as usize..(*compr_offset + *compr_len as u64) as usize];
            let plain = zstd::bulk::decompress(compr_bytes, frame_uncompressed_len)
                .context("failed to decompress frame")?;

            let within_frame_start = (remaining_start - frame_uncompressed_start) as usize;
            let available = plain.len() - within_frame_start;
            let take = available.min(remaining_len as usize);

            out.extend_from_slice(&plain[within_frame_start..within_frame_start + take]);

            remaining_start += take as u64;
            remaining_len -= take as u64;
        }

        if remaining_len != 0 {
            bail!("read_at ran out of frames before satisfying the request");
        }

        Ok(out)
    }
}
