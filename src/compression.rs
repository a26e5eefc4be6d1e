//! Block compression codecs and the writer's selection policy.
//!
//! Snappy payloads carry their own length header. LZ4 and Zstd payloads are
//! prefixed with the decompressed length as a varint32.

use crate::coding::{get_varint32, put_varint32};
use crate::config::CompressionType;
use crate::error::{Error, Result};
use std::borrow::Cow;

/// Settings the writer applies to every block it compresses.
#[derive(Debug, Clone, Copy)]
pub struct CompressionContext<'a> {
    /// Requested algorithm.
    pub compression: CompressionType,
    /// Codec level (zstd only).
    pub level: i32,
    /// Dictionary (zstd only). Empty means none.
    pub dict: &'a [u8],
    /// Blocks at or above this size are not compressed.
    pub size_limit: usize,
    /// Decompress and compare every compressed block.
    pub verify: bool,
}

/// Compresses `raw` with the given codec. `None` when the codec is compiled
/// out or fails.
pub fn compress(compression: CompressionType, raw: &[u8], level: i32, dict: &[u8]) -> Option<Vec<u8>> {
    match compression {
        CompressionType::None => Some(raw.to_vec()),
        CompressionType::Snappy => snappy_compress(raw),
        CompressionType::Lz4 => lz4_compress(raw),
        CompressionType::Zstd => zstd_compress(raw, level, dict),
    }
}

/// Decompresses a block payload. Any failure is reported as corruption.
pub fn decompress(compression: CompressionType, data: &[u8], dict: &[u8]) -> Result<Vec<u8>> {
    let out = match compression {
        CompressionType::None => Some(data.to_vec()),
        CompressionType::Snappy => snappy_decompress(data),
        CompressionType::Lz4 => lz4_decompress(data),
        CompressionType::Zstd => zstd_decompress(data, dict),
    };
    out.ok_or_else(|| {
        Error::corruption(format!(
            "{} not supported or corrupted {} compressed block contents",
            compression.name(),
            compression.name()
        ))
    })
}

/// True when `compressed_size` saves at least 12.5% over `raw_size`.
pub fn good_compression_ratio(compressed_size: usize, raw_size: usize) -> bool {
    compressed_size < raw_size - raw_size / 8
}

/// Compresses a block for writing, falling back to the raw bytes when
/// compression is disabled, too expensive, fails, or does not pay off.
///
/// With `verify` set, a compressed block that does not decompress back to
/// `raw` is a corruption error and nothing should be written.
pub fn compress_block<'a>(raw: &'a [u8], ctx: &CompressionContext<'_>) -> Result<(Cow<'a, [u8]>, CompressionType)> {
    if ctx.compression == CompressionType::None || raw.len() >= ctx.size_limit {
        return Ok((Cow::Borrowed(raw), CompressionType::None));
    }

    let compressed = match compress(ctx.compression, raw, ctx.level, ctx.dict) {
        Some(c) if good_compression_ratio(c.len(), raw.len()) => c,
        _ => return Ok((Cow::Borrowed(raw), CompressionType::None)),
    };

    if ctx.verify {
        verify_compressed(ctx.compression, raw, &compressed, ctx.dict)?;
    }

    Ok((Cow::Owned(compressed), ctx.compression))
}

/// Checks that `compressed` decompresses back to `raw`.
pub fn verify_compressed(compression: CompressionType, raw: &[u8], compressed: &[u8], dict: &[u8]) -> Result<()> {
    match decompress(compression, compressed, dict) {
        Ok(ref out) if out.as_slice() == raw => Ok(()),
        Ok(_) => {
            log::error!("Decompressed {} block does not match the raw block", compression.name());
            Err(Error::corruption("Decompressed block did not match raw block"))
        }
        Err(e) => {
            log::error!("Verification of {} compression failed: {}", compression.name(), e);
            Err(Error::corruption(format!("Could not decompress block for verification: {}", e)))
        }
    }
}

#[cfg_attr(not(any(feature = "lz4-compression", feature = "zstd-compression")), allow(dead_code))]
fn with_length_prefix(raw_len: usize, body: Vec<u8>) -> Option<Vec<u8>> {
    let raw_len = u32::try_from(raw_len).ok()?;
    let mut out = Vec::with_capacity(body.len() + 5);
    put_varint32(&mut out, raw_len);
    out.extend_from_slice(&body);
    Some(out)
}

#[cfg_attr(not(any(feature = "lz4-compression", feature = "zstd-compression")), allow(dead_code))]
fn split_length_prefix(data: &[u8]) -> Option<(usize, &[u8])> {
    let mut input = data;
    let len = get_varint32(&mut input)?;
    Some((len as usize, input))
}

#[cfg(feature = "snappy")]
fn snappy_compress(raw: &[u8]) -> Option<Vec<u8>> {
    snap::raw::Encoder::new().compress_vec(raw).ok()
}

#[cfg(not(feature = "snappy"))]
fn snappy_compress(_raw: &[u8]) -> Option<Vec<u8>> {
    None
}

#[cfg(feature = "snappy")]
fn snappy_decompress(data: &[u8]) -> Option<Vec<u8>> {
    snap::raw::Decoder::new().decompress_vec(data).ok()
}

#[cfg(not(feature = "snappy"))]
fn snappy_decompress(_data: &[u8]) -> Option<Vec<u8>> {
    None
}

#[cfg(feature = "lz4-compression")]
fn lz4_compress(raw: &[u8]) -> Option<Vec<u8>> {
    let body = lz4::block::compress(raw, None, false).ok()?;
    with_length_prefix(raw.len(), body)
}

#[cfg(not(feature = "lz4-compression"))]
fn lz4_compress(_raw: &[u8]) -> Option<Vec<u8>> {
    None
}

#[cfg(feature = "lz4-compression")]
fn lz4_decompress(data: &[u8]) -> Option<Vec<u8>> {
    let (len, body) = split_length_prefix(data)?;
    let out = lz4::block::decompress(body, Some(i32::try_from(len).ok()?)).ok()?;
    (out.len() == len).then_some(out)
}

#[cfg(not(feature = "lz4-compression"))]
fn lz4_decompress(_data: &[u8]) -> Option<Vec<u8>> {
    None
}

#[cfg(feature = "zstd-compression")]
fn zstd_compress(raw: &[u8], level: i32, dict: &[u8]) -> Option<Vec<u8>> {
    let body = if dict.is_empty() {
        zstd::bulk::compress(raw, level).ok()?
    } else {
        zstd::bulk::Compressor::with_dictionary(level, dict).ok()?.compress(raw).ok()?
    };
    with_length_prefix(raw.len(), body)
}

#[cfg(not(feature = "zstd-compression"))]
fn zstd_compress(_raw: &[u8], _level: i32, _dict: &[u8]) -> Option<Vec<u8>> {
    None
}

#[cfg(feature = "zstd-compression")]
fn zstd_decompress(data: &[u8], dict: &[u8]) -> Option<Vec<u8>> {
    let (len, body) = split_length_prefix(data)?;
    let out = if dict.is_empty() {
        zstd::bulk::decompress(body, len).ok()?
    } else {
        zstd::bulk::Decompressor::with_dictionary(dict).ok()?.decompress(body, len).ok()?
    };
    (out.len() == len).then_some(out)
}

#[cfg(not(feature = "zstd-compression"))]
fn zstd_decompress(_data: &[u8], _dict: &[u8]) -> Option<Vec<u8>> {
    None
}
