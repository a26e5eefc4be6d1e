//! On-disk encodings shared by the builder and the reader: block handles,
//! block trailers and checksums, and the footer.

use crate::cache::PersistentCache;
use crate::coding::{decode_fixed32, decode_fixed64, get_varint32, get_varint64, put_fixed32, put_fixed64, put_varint64};
use crate::compression;
use crate::config::{ChecksumType, CompressionType};
use crate::error::{Error, Result};
use crate::file::RandomAccessFile;
use crate::statistics::{record_tick, Statistics, Ticker};
use bytes::Bytes;
use std::fmt;

/// Magic number of tables written with `format_version == 0`. Upgraded to
/// [`BLOCK_BASED_TABLE_MAGIC_NUMBER`] on decode.
pub const LEGACY_BLOCK_BASED_TABLE_MAGIC_NUMBER: u64 = 0xdb4775248b80fb57;
/// Magic number of block-based tables.
pub const BLOCK_BASED_TABLE_MAGIC_NUMBER: u64 = 0x88e241b785f4cff7;
/// Magic number of block-based tables placed in a fixed-size extent.
pub const EXTENT_BASED_TABLE_MAGIC_NUMBER: u64 = 0x8fb5a3c17e6d2049;

/// 1-byte compression type plus 4-byte checksum.
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// Blocks this small are read into a stack buffer.
const DEFAULT_STACK_BUFFER_SIZE: usize = 5000;

/// BlockHandle represents a pointer to a block in the SSTable file.
///
/// Encoded as two varint64s: offset then size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct BlockHandle {
    offset: u64,
    size: u64,
}

impl BlockHandle {
    /// Maximum encoding length of a BlockHandle
    pub const MAX_ENCODED_LENGTH: usize = 10 + 10;

    /// Placeholder for a handle that has not been assigned yet.
    pub const UNSET: BlockHandle = BlockHandle { offset: u64::MAX, size: u64::MAX };

    /// Handle of the empty block at offset zero.
    pub const NULL: BlockHandle = BlockHandle { offset: 0, size: 0 };

    /// Create a new BlockHandle
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// Offset of the block in the file
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Size of the block, excluding its trailer
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether both fields have been assigned.
    pub fn is_set(&self) -> bool {
        self.offset != u64::MAX && self.size != u64::MAX
    }

    /// Appends the varint encoding to `dst`.
    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        // Sanity check that all fields have been set
        assert!(self.is_set(), "BlockHandle encoded before being set");
        put_varint64(dst, self.offset);
        put_varint64(dst, self.size);
    }

    /// Encode the BlockHandle to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::MAX_ENCODED_LENGTH);
        self.encode_to(&mut buf);
        buf
    }

    /// Decodes a handle from the front of `input`, advancing it. On failure
    /// the handle is reset to `(0, 0)`.
    pub fn decode_from(&mut self, input: &mut &[u8]) -> Result<()> {
        match (get_varint64(input), get_varint64(input)) {
            (Some(offset), Some(size)) => {
                self.offset = offset;
                self.size = size;
                Ok(())
            }
            _ => {
                *self = Self::NULL;
                Err(Error::corruption("bad block handle"))
            }
        }
    }

    /// Decode a BlockHandle from bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut handle = Self::NULL;
        let mut input = data;
        handle.decode_from(&mut input)?;
        Ok(handle)
    }
}

impl fmt::Display for BlockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "offset={} size={}", self.offset, self.size)
    }
}

/// Cache key of the block at `offset` for a file with `prefix`.
pub fn cache_key(prefix: &[u8], offset: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 10);
    key.extend_from_slice(prefix);
    put_varint64(&mut key, offset);
    key
}

/// The fixed-size trailer of every table file.
///
/// Legacy layout (48 bytes), `format_version == 0`:
/// ```text
/// [metaindex handle][index handle][padding to 40][magic: u64]
/// ```
/// Versioned layout (53 bytes):
/// ```text
/// [checksum: u8][metaindex handle][index handle][padding to 41][version: u32][magic: u64]
/// ```
/// Extent layout (65 bytes):
/// ```text
/// [valid_size: u32][next_extent: u64][checksum: u8][metaindex handle][index handle]
/// [padding to 53][version: u32][magic: u64]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Footer {
    /// Table format version; 0 for the legacy layout.
    pub version: u32,
    /// Checksum algorithm of every block.
    pub checksum: ChecksumType,
    /// Handle to the meta index block
    pub metaindex_handle: BlockHandle,
    /// Handle to the index block
    pub index_handle: BlockHandle,
    /// Canonical magic number; never the legacy value.
    pub table_magic_number: u64,
    /// Bytes of the extent holding table data (extent layout only).
    pub valid_size: u32,
    /// Next extent in the chain (extent layout only).
    pub next_extent: u64,
}

impl Footer {
    /// Encoded length of the legacy layout.
    pub const LEGACY_ENCODED_LENGTH: usize = 2 * BlockHandle::MAX_ENCODED_LENGTH + 8;
    /// Encoded length of the versioned layout.
    pub const VERSION1_ENCODED_LENGTH: usize = 1 + 2 * BlockHandle::MAX_ENCODED_LENGTH + 4 + 8;
    /// Encoded length of the extent layout.
    pub const EXTENT_ENCODED_LENGTH: usize = 4 + 8 + Self::VERSION1_ENCODED_LENGTH;
    /// Shortest valid footer.
    pub const MIN_ENCODED_LENGTH: usize = Self::LEGACY_ENCODED_LENGTH;
    /// Longest valid footer.
    pub const MAX_ENCODED_LENGTH: usize = Self::EXTENT_ENCODED_LENGTH;

    /// A footer with unset handles. `table_magic_number` must be canonical.
    pub fn new(table_magic_number: u64, version: u32) -> Self {
        debug_assert!(table_magic_number != LEGACY_BLOCK_BASED_TABLE_MAGIC_NUMBER);
        Self {
            version,
            checksum: ChecksumType::Crc32c,
            metaindex_handle: BlockHandle::UNSET,
            index_handle: BlockHandle::UNSET,
            table_magic_number,
            valid_size: 0,
            next_extent: 0,
        }
    }

    /// Whether this footer uses the extent layout.
    pub fn is_extent(&self) -> bool {
        self.table_magic_number == EXTENT_BASED_TABLE_MAGIC_NUMBER
    }

    /// Whether this footer uses the legacy layout.
    pub fn is_legacy(&self) -> bool {
        !self.is_extent() && self.version == 0
    }

    /// Encoded length for this footer's layout.
    pub fn encoded_length(&self) -> usize {
        if self.is_extent() {
            Self::EXTENT_ENCODED_LENGTH
        } else if self.version == 0 {
            Self::LEGACY_ENCODED_LENGTH
        } else {
            Self::VERSION1_ENCODED_LENGTH
        }
    }

    /// Appends the footer to `dst`.
    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        let start = dst.len();
        if self.is_extent() {
            put_fixed32(dst, self.valid_size);
            put_fixed64(dst, self.next_extent);
            dst.push(self.checksum as u8);
            self.metaindex_handle.encode_to(dst);
            self.index_handle.encode_to(dst);
            dst.resize(start + Self::EXTENT_ENCODED_LENGTH - 12, 0);
            put_fixed32(dst, self.version);
            put_fixed64(dst, self.table_magic_number);
        } else if self.version == 0 {
            assert_eq!(self.checksum, ChecksumType::Crc32c, "legacy footer requires CRC32C");
            self.metaindex_handle.encode_to(dst);
            self.index_handle.encode_to(dst);
            dst.resize(start + 2 * BlockHandle::MAX_ENCODED_LENGTH, 0);
            put_fixed64(dst, LEGACY_BLOCK_BASED_TABLE_MAGIC_NUMBER);
        } else {
            dst.push(self.checksum as u8);
            self.metaindex_handle.encode_to(dst);
            self.index_handle.encode_to(dst);
            dst.resize(start + Self::VERSION1_ENCODED_LENGTH - 12, 0);
            put_fixed32(dst, self.version);
            put_fixed64(dst, self.table_magic_number);
        }
        debug_assert_eq!(dst.len(), start + self.encoded_length());
    }

    /// Encode the footer to bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::MAX_ENCODED_LENGTH);
        self.encode_to(&mut buf);
        buf
    }

    /// Decodes the footer that ends at the end of `input`.
    pub fn decode_from(input: &[u8]) -> Result<Self> {
        if input.len() < Self::MIN_ENCODED_LENGTH {
            return Err(Error::corruption("input is too short to be an sstable"));
        }
        let mut magic = decode_fixed64(&input[input.len() - 8..])
            .ok_or_else(|| Error::corruption("input is too short to be an sstable"))?;

        let legacy = magic == LEGACY_BLOCK_BASED_TABLE_MAGIC_NUMBER;
        if legacy {
            magic = BLOCK_BASED_TABLE_MAGIC_NUMBER;
        }
        let len = match magic {
            BLOCK_BASED_TABLE_MAGIC_NUMBER if legacy => Self::LEGACY_ENCODED_LENGTH,
            BLOCK_BASED_TABLE_MAGIC_NUMBER => Self::VERSION1_ENCODED_LENGTH,
            EXTENT_BASED_TABLE_MAGIC_NUMBER => Self::EXTENT_ENCODED_LENGTH,
            other => return Err(Error::corruption(format!("bad table magic number: {:#x}", other))),
        };
        if input.len() < len {
            return Err(Error::corruption("truncated footer"));
        }
        let footer = &input[input.len() - len..];

        let mut out = Footer::new(magic, 0);
        let mut handles = if legacy {
            &footer[..2 * BlockHandle::MAX_ENCODED_LENGTH]
        } else {
            let mut fields = footer;
            if magic == EXTENT_BASED_TABLE_MAGIC_NUMBER {
                out.valid_size = decode_fixed32(fields).ok_or_else(|| Error::corruption("truncated footer"))?;
                out.next_extent = decode_fixed64(&fields[4..]).ok_or_else(|| Error::corruption("truncated footer"))?;
                fields = &fields[12..];
            }
            let checksum = get_varint32(&mut fields).ok_or_else(|| Error::corruption("bad checksum type"))?;
            out.checksum = ChecksumType::from_u32(checksum)
                .ok_or_else(|| Error::corruption(format!("unknown checksum type {}", checksum)))?;
            out.version = decode_fixed32(&footer[len - 12..]).ok_or_else(|| Error::corruption("truncated footer"))?;
            &fields[..fields.len() - 12]
        };

        out.metaindex_handle.decode_from(&mut handles)?;
        out.index_handle.decode_from(&mut handles)?;
        Ok(out)
    }
}

/// Masks a CRC so that checksums of data containing embedded CRCs are not
/// themselves trivially predictable.
pub fn mask_crc(crc: u32) -> u32 {
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282ead8)
}

/// Inverse of [`mask_crc`].
pub fn unmask_crc(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(0xa282ead8);
    (rot >> 17) | (rot << 15)
}

/// Checksum stored in a block trailer: covers `data` followed by the
/// compression type byte.
pub fn compute_checksum(checksum: ChecksumType, data: &[u8], type_byte: u8) -> Result<u32> {
    match checksum {
        ChecksumType::Crc32c => {
            let crc = crc32c::crc32c_append(crc32c::crc32c(data), &[type_byte]);
            Ok(mask_crc(crc))
        }
        ChecksumType::XxHash => {
            let mut hasher = xxhash_rust::xxh32::Xxh32::new(0);
            hasher.update(data);
            hasher.update(&[type_byte]);
            Ok(hasher.digest())
        }
        ChecksumType::NoChecksum => Err(Error::not_supported("tables without checksums")),
    }
}

/// Builds the 5-byte trailer for `data` stored with `compression_type`.
pub fn block_trailer(checksum: ChecksumType, data: &[u8], compression_type: CompressionType) -> Result<[u8; BLOCK_TRAILER_SIZE]> {
    let type_byte = compression_type as u8;
    let crc = compute_checksum(checksum, data, type_byte)?;
    let mut trailer = [0u8; BLOCK_TRAILER_SIZE];
    trailer[0] = type_byte;
    trailer[1..].copy_from_slice(&crc.to_le_bytes());
    Ok(trailer)
}

/// Contents of one block.
#[derive(Debug, Clone)]
pub struct BlockContents {
    /// Block bytes, without the trailer.
    pub data: Bytes,
    /// How `data` is compressed.
    pub compression_type: CompressionType,
}

impl BlockContents {
    /// Wrap block bytes.
    pub fn new(data: Bytes, compression_type: CompressionType) -> Self {
        Self { data, compression_type }
    }
}

/// Everything needed to read a block from a table file.
#[derive(Clone, Copy)]
pub struct BlockFetchContext<'a> {
    /// Table file.
    pub file: &'a dyn RandomAccessFile,
    /// Checksum algorithm from the footer.
    pub checksum: ChecksumType,
    /// Verify block checksums.
    pub verify_checksums: bool,
    /// Consulted before the file.
    pub persistent_cache: Option<&'a dyn PersistentCache>,
    /// Prefix of the file's cache keys.
    pub cache_key_prefix: &'a [u8],
    /// Zstd dictionary for data blocks.
    pub compression_dict: &'a [u8],
    /// Counter sink.
    pub statistics: Option<&'a Statistics>,
}

/// Reads the block at `handle`, verifying its checksum when requested and
/// decompressing it if `decompress` is set.
///
/// A checksum mismatch, a short read or an unknown compression type is a
/// corruption error.
pub fn read_block_contents(ctx: &BlockFetchContext<'_>, handle: &BlockHandle, decompress: bool) -> Result<BlockContents> {
    let n = usize::try_from(handle.size()).map_err(|_| Error::corruption("block size overflows usize"))?;
    let total = n
        .checked_add(BLOCK_TRAILER_SIZE)
        .ok_or_else(|| Error::corruption("block size overflows usize"))?;

    let persistent_key = ctx.persistent_cache.map(|_| cache_key(ctx.cache_key_prefix, handle.offset()));
    if let (Some(cache), Some(key)) = (ctx.persistent_cache, &persistent_key) {
        match cache.lookup(key) {
            Ok(Some(raw)) if raw.len() == total => {
                record_tick(ctx.statistics, Ticker::PersistentCacheHit, 1);
                return finish_block_read(ctx, handle, &raw, decompress);
            }
            Ok(_) => record_tick(ctx.statistics, Ticker::PersistentCacheMiss, 1),
            Err(e) => {
                log::warn!("Error reading from persistent cache: {}", e);
                record_tick(ctx.statistics, Ticker::PersistentCacheMiss, 1);
            }
        }
    }

    let mut stack_buf = [0u8; DEFAULT_STACK_BUFFER_SIZE];
    let mut heap_buf = Vec::new();
    let buf: &mut [u8] = if total <= DEFAULT_STACK_BUFFER_SIZE {
        &mut stack_buf[..total]
    } else {
        heap_buf
            .try_reserve_exact(total)
            .map_err(|_| Error::memory_limit(format!("cannot allocate {} bytes for block read", total)))?;
        heap_buf.resize(total, 0);
        &mut heap_buf[..]
    };

    let read = ctx.file.read_at(handle.offset(), buf)?;
    record_tick(ctx.statistics, Ticker::BlockRead, 1);
    record_tick(ctx.statistics, Ticker::BytesRead, read as u64);
    if read != total {
        return Err(Error::corruption(format!(
            "truncated block read: expected {} bytes at {}, got {}",
            total,
            handle.offset(),
            read
        )));
    }

    let contents = finish_block_read(ctx, handle, buf, decompress)?;

    if let (Some(cache), Some(key)) = (ctx.persistent_cache, &persistent_key) {
        if let Err(e) = cache.insert(key, buf) {
            log::warn!("Error inserting into persistent cache: {}", e);
        }
    }
    Ok(contents)
}

fn finish_block_read(ctx: &BlockFetchContext<'_>, handle: &BlockHandle, raw: &[u8], decompress: bool) -> Result<BlockContents> {
    let (data, trailer) = raw.split_at(raw.len() - BLOCK_TRAILER_SIZE);
    let type_byte = trailer[0];

    if ctx.verify_checksums {
        let expected = decode_fixed32(&trailer[1..]).ok_or_else(|| Error::corruption("truncated block trailer"))?;
        let actual = compute_checksum(ctx.checksum, data, type_byte)?;
        if expected != actual {
            record_tick(ctx.statistics, Ticker::BlockChecksumFailure, 1);
            log::warn!("Block checksum mismatch at {}", handle);
            return Err(Error::ChecksumMismatch { expected, actual });
        }
    }

    let compression_type = CompressionType::from_u8(type_byte)
        .ok_or_else(|| Error::corruption(format!("bad block type {} at {}", type_byte, handle)))?;

    if decompress && compression_type != CompressionType::None {
        let out = compression::decompress(compression_type, data, ctx.compression_dict)?;
        record_tick(ctx.statistics, Ticker::BlockDecompressed, 1);
        return Ok(BlockContents::new(Bytes::from(out), CompressionType::None));
    }
    Ok(BlockContents::new(Bytes::copy_from_slice(data), compression_type))
}

/// Reads and decodes the footer of a table.
///
/// The footer ends at `extent_size` when the table lives in an extent,
/// otherwise at `file_size`.
pub fn read_footer_from_file(file: &dyn RandomAccessFile, file_size: u64, extent_size: Option<u64>) -> Result<Footer> {
    let end = match extent_size {
        Some(extent) if extent > file_size => {
            return Err(Error::corruption(format!(
                "file of {} bytes is smaller than its extent of {} bytes",
                file_size, extent
            )))
        }
        Some(extent) => extent,
        None => file_size,
    };
    if end < Footer::MIN_ENCODED_LENGTH as u64 {
        return Err(Error::corruption("file is too short to be an sstable"));
    }

    let read_len = end.min(Footer::MAX_ENCODED_LENGTH as u64) as usize;
    let mut buf = [0u8; Footer::MAX_ENCODED_LENGTH];
    let read = file.read_at(end - read_len as u64, &mut buf[..read_len])?;
    if read < read_len {
        return Err(Error::corruption("truncated footer read"));
    }
    Footer::decode_from(&buf[..read_len])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryPersistentCache;
    use crate::file::{MemFile, WritableFile};
    use proptest::prelude::*;

    fn footer(magic: u64, version: u32, checksum: ChecksumType) -> Footer {
        let mut footer = Footer::new(magic, version);
        footer.checksum = checksum;
        footer.metaindex_handle = BlockHandle::new(1000, 100);
        footer.index_handle = BlockHandle::new(1105, 300);
        footer
    }

    #[test]
    fn test_block_handle_encode_decode() {
        let handle = BlockHandle::new(1234, 5678);
        let encoded = handle.encode();
        assert_eq!(encoded.len(), 4);
        assert_eq!(BlockHandle::decode(&encoded).unwrap(), handle);
        assert!(!BlockHandle::UNSET.is_set());
    }

    #[test]
    fn test_block_handle_decode_failure_resets() {
        let mut handle = BlockHandle::new(7, 7);
        // Stray high bit with nothing after it.
        let mut input: &[u8] = &[0x80];
        assert!(handle.decode_from(&mut input).unwrap_err().is_corruption());
        assert_eq!(handle, BlockHandle::NULL);

        // Offset present, size truncated.
        let mut handle = BlockHandle::new(7, 7);
        let mut input: &[u8] = &[0x05, 0xff];
        assert!(handle.decode_from(&mut input).is_err());
        assert_eq!(handle, BlockHandle::NULL);
    }

    #[test]
    #[should_panic(expected = "BlockHandle encoded before being set")]
    fn test_encode_unset_handle_panics() {
        BlockHandle::UNSET.encode();
    }

    #[test]
    fn test_footer_layouts() {
        let legacy = footer(BLOCK_BASED_TABLE_MAGIC_NUMBER, 0, ChecksumType::Crc32c);
        let encoded = legacy.encode();
        assert_eq!(encoded.len(), 48);
        assert_eq!(decode_fixed64(&encoded[40..]), Some(LEGACY_BLOCK_BASED_TABLE_MAGIC_NUMBER));
        let decoded = Footer::decode_from(&encoded).unwrap();
        assert_eq!(decoded, legacy);
        assert_eq!(decoded.table_magic_number, BLOCK_BASED_TABLE_MAGIC_NUMBER);

        let versioned = footer(BLOCK_BASED_TABLE_MAGIC_NUMBER, 2, ChecksumType::XxHash);
        let encoded = versioned.encode();
        assert_eq!(encoded.len(), 53);
        assert_eq!(encoded[0], 2);
        assert_eq!(Footer::decode_from(&encoded).unwrap(), versioned);

        let mut extent = footer(EXTENT_BASED_TABLE_MAGIC_NUMBER, 2, ChecksumType::Crc32c);
        extent.valid_size = 4000;
        extent.next_extent = 42;
        let encoded = extent.encode();
        assert_eq!(encoded.len(), 65);
        assert_eq!(Footer::decode_from(&encoded).unwrap(), extent);
    }

    #[test]
    fn test_footer_decode_errors() {
        let versioned = footer(BLOCK_BASED_TABLE_MAGIC_NUMBER, 1, ChecksumType::Crc32c);
        let mut encoded = versioned.encode();

        // Unknown checksum type.
        encoded[0] = 9;
        assert!(Footer::decode_from(&encoded).unwrap_err().is_corruption());

        // Unknown magic.
        let mut encoded = versioned.encode();
        let n = encoded.len();
        encoded[n - 1] ^= 0xff;
        assert!(Footer::decode_from(&encoded).unwrap_err().is_corruption());

        // Too short.
        assert!(Footer::decode_from(&[0u8; 20]).is_err());

        // Versioned magic with only the legacy length available.
        let encoded = versioned.encode();
        assert!(Footer::decode_from(&encoded[5..]).is_err());
    }

    #[test]
    fn test_footer_decode_with_leading_bytes() {
        let versioned = footer(BLOCK_BASED_TABLE_MAGIC_NUMBER, 2, ChecksumType::Crc32c);
        let mut input = vec![0xAB; 12];
        versioned.encode_to(&mut input);
        assert_eq!(Footer::decode_from(&input).unwrap(), versioned);
    }

    #[test]
    fn test_crc_mask_roundtrip() {
        let crc = crc32c::crc32c(b"foo");
        assert_ne!(mask_crc(crc), crc);
        assert_ne!(mask_crc(mask_crc(crc)), crc);
        assert_eq!(unmask_crc(mask_crc(crc)), crc);
        assert_eq!(unmask_crc(unmask_crc(mask_crc(mask_crc(crc)))), crc);
    }

    #[test]
    fn test_checksums_cover_type_byte() {
        for ty in [ChecksumType::Crc32c, ChecksumType::XxHash] {
            let a = compute_checksum(ty, b"block", 0).unwrap();
            let b = compute_checksum(ty, b"block", 1).unwrap();
            assert_ne!(a, b);
        }
        assert!(matches!(
            compute_checksum(ChecksumType::NoChecksum, b"block", 0),
            Err(Error::NotSupported(_))
        ));
    }


    fn write_block(file: &MemFile, data: &[u8], ty: CompressionType) -> BlockHandle {
        let handle = BlockHandle::new(file.len() as u64, data.len() as u64);
        let trailer = block_trailer(ChecksumType::Crc32c, data, ty).unwrap();
        let mut writer = file.clone();
        writer.append(data).unwrap();
        writer.append(&trailer).unwrap();
        handle
    }

    fn ctx<'a>(file: &'a MemFile, verify: bool) -> BlockFetchContext<'a> {
        BlockFetchContext {
            file,
            checksum: ChecksumType::Crc32c,
            verify_checksums: verify,
            persistent_cache: None,
            cache_key_prefix: b"prefix",
            compression_dict: b"",
            statistics: None,
        }
    }

    #[test]
    fn test_read_block_contents() {
        let file = MemFile::new();
        let small = write_block(&file, b"hello block", CompressionType::None);
        let large_data = vec![b'x'; 10_000];
        let large = write_block(&file, &large_data, CompressionType::None);

        let contents = read_block_contents(&ctx(&file, true), &small, true).unwrap();
        assert_eq!(&contents.data[..], b"hello block");
        assert_eq!(contents.compression_type, CompressionType::None);

        let contents = read_block_contents(&ctx(&file, true), &large, true).unwrap();
        assert_eq!(&contents.data[..], &large_data[..]);
    }

    #[test]
    fn test_checksum_mismatch_and_truncation() {
        let file = MemFile::new();
        let handle = write_block(&file, b"hello block", CompressionType::None);
        file.corrupt_byte(3, 0x01);

        let err = read_block_contents(&ctx(&file, true), &handle, true).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        // Not verified: corrupted bytes come back as-is.
        let contents = read_block_contents(&ctx(&file, false), &handle, true).unwrap();
        assert_eq!(&contents.data[..], b"helmo block");

        let beyond = BlockHandle::new(0, 100);
        let err = read_block_contents(&ctx(&file, false), &beyond, true).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_unknown_compression_type() {
        let file = MemFile::new();
        let handle = BlockHandle::new(0, 4);
        let mut writer = file.clone();
        writer.append(b"data").unwrap();
        let crc = compute_checksum(ChecksumType::Crc32c, b"data", 0x55).unwrap();
        writer.append(&[0x55]).unwrap();
        writer.append(&crc.to_le_bytes()).unwrap();

        let err = read_block_contents(&ctx(&file, true), &handle, true).unwrap_err();
        assert!(err.is_corruption());
    }

    #[cfg(feature = "snappy")]
    #[test]
    fn test_decompress_on_read() {
        let raw = b"abcdabcdabcdabcdabcdabcdabcdabcdabcdabcd".repeat(10);
        let compressed = compression::compress(CompressionType::Snappy, &raw, 0, b"").unwrap();
        let file = MemFile::new();
        let handle = write_block(&file, &compressed, CompressionType::Snappy);
        let stats = Statistics::new();
        let mut ctx = ctx(&file, true);
        ctx.statistics = Some(&stats);

        let contents = read_block_contents(&ctx, &handle, true).unwrap();
        assert_eq!(contents.compression_type, CompressionType::None);
        assert_eq!(&contents.data[..], &raw[..]);
        assert_eq!(stats.get(Ticker::BlockDecompressed), 1);

        let contents = read_block_contents(&ctx, &handle, false).unwrap();
        assert_eq!(contents.compression_type, CompressionType::Snappy);
        assert_eq!(&contents.data[..], &compressed[..]);
    }

    #[test]
    fn test_persistent_cache_serves_reads() {
        let file = MemFile::new();
        let handle = write_block(&file, b"cached block", CompressionType::None);
        let cache = MemoryPersistentCache::new(1 << 20);
        let stats = Statistics::new();
        let mut ctx = ctx(&file, true);
        ctx.persistent_cache = Some(&cache);
        ctx.statistics = Some(&stats);

        read_block_contents(&ctx, &handle, true).unwrap();
        assert_eq!(stats.get(Ticker::BlockRead), 1);
        assert_eq!(cache.len(), 1);

        file.truncate(0);
        let contents = read_block_contents(&ctx, &handle, true).unwrap();
        assert_eq!(&contents.data[..], b"cached block");
        assert_eq!(stats.get(Ticker::BlockRead), 1);
        assert_eq!(stats.get(Ticker::PersistentCacheHit), 1);
    }

    #[test]
    fn test_read_footer_from_file() {
        let file = MemFile::new();
        let mut writer = file.clone();
        writer.append(&[0u8; 100]).unwrap();
        let footer = footer(BLOCK_BASED_TABLE_MAGIC_NUMBER, 2, ChecksumType::Crc32c);
        writer.append(&footer.encode()).unwrap();
        let size = file.len() as u64;
        assert_eq!(read_footer_from_file(&file, size, None).unwrap(), footer);

        // Footer ends at the extent boundary, not at end-of-file.
        writer.append(&[0u8; 30]).unwrap();
        let grown = file.len() as u64;
        assert!(read_footer_from_file(&file, grown, None).is_err());
        assert_eq!(read_footer_from_file(&file, grown, Some(size)).unwrap(), footer);
        assert!(read_footer_from_file(&file, grown, Some(grown + 1)).is_err());

        let tiny = MemFile::from_vec(vec![0u8; 10]);
        assert!(read_footer_from_file(&tiny, 10, None).unwrap_err().is_corruption());
    }

    proptest! {
        #[test]
        fn prop_block_handle_roundtrip(offset in 0u64..u64::MAX, size in 0u64..u64::MAX) {
            let handle = BlockHandle::new(offset, size);
            let encoded = handle.encode();
            prop_assert!(encoded.len() <= BlockHandle::MAX_ENCODED_LENGTH);
            prop_assert_eq!(BlockHandle::decode(&encoded).unwrap(), handle);
        }

        #[test]
        fn prop_footer_roundtrip(
            meta in (0u64..u64::MAX, 0u64..u64::MAX),
            index in (0u64..u64::MAX, 0u64..u64::MAX),
            version in 1u32..3,
            xxhash in any::<bool>(),
            extent in proptest::option::of((any::<u32>(), any::<u64>())),
        ) {
            let magic = if extent.is_some() { EXTENT_BASED_TABLE_MAGIC_NUMBER } else { BLOCK_BASED_TABLE_MAGIC_NUMBER };
            let mut footer = Footer::new(magic, version);
            footer.checksum = if xxhash { ChecksumType::XxHash } else { ChecksumType::Crc32c };
            footer.metaindex_handle = BlockHandle::new(meta.0, meta.1);
            footer.index_handle = BlockHandle::new(index.0, index.1);
            if let Some((valid_size, next_extent)) = extent {
                footer.valid_size = valid_size;
                footer.next_extent = next_extent;
            }
            let encoded = footer.encode();
            prop_assert_eq!(encoded.len(), footer.encoded_length());
            prop_assert_eq!(Footer::decode_from(&encoded).unwrap(), footer);
        }
    }
}
