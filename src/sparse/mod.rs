//! Android sparse image codec.
//!
//! Platform and userdata contents ship in the Android sparse format: a
//! file header followed by chunks that each expand to a whole number of
//! blocks.
//!
//! ```text
//! file header (28 bytes, LE)
//!   magic 0xED26FF3A | major 1 | minor 0 | file_hdr_sz | chunk_hdr_sz
//!   blk_sz | total_blks | total_chunks | image_checksum
//! chunk header (12 bytes, LE)
//!   type | reserved | chunk_sz (blocks) | total_sz (bytes incl. header)
//! ```
//!
//! | type   | body             | output                      |
//! |--------|------------------|-----------------------------|
//! | 0xCAC1 | chunk_sz blocks  | the body                    |
//! | 0xCAC2 | 4-byte pattern   | pattern repeated            |
//! | 0xCAC3 | none             | nothing written (zeros)     |
//! | 0xCAC4 | CRC32            | none; verified              |
//!
//! A CRC32 chunk covers the expanded bytes since the previous CRC32 chunk.

mod codec;

pub use codec::{NativeCodec, Simg2img, SparseCodec};

use tracing::debug;
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{Error, Result};

pub const SPARSE_MAGIC: u32 = 0xED26_FF3A;
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

const MAJOR_VERSION: u16 = 1;
const FILE_HEADER_LEN: usize = std::mem::size_of::<RawFileHeader>();
const CHUNK_HEADER_LEN: usize = std::mem::size_of::<RawChunkHeader>();

const CHUNK_RAW: u16 = 0xCAC1;
const CHUNK_FILL: u16 = 0xCAC2;
const CHUNK_DONT_CARE: u16 = 0xCAC3;
const CHUNK_CRC32: u16 = 0xCAC4;

/// Largest buffer materialised for fill patterns and zero runs.
const FILL_BUFFER_LEN: usize = 1024 * 1024;

/// Longest run the encoder puts in one chunk.
const MAX_RUN_BYTES: u64 = 64 * 1024 * 1024;

fn malformed(reason: impl Into<String>) -> Error {
    Error::SparseDecode(reason.into())
}

/// Raw on-disk file header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawFileHeader {
    magic: U32,
    major_version: U16,
    minor_version: U16,
    file_hdr_sz: U16,
    chunk_hdr_sz: U16,
    blk_sz: U32,
    total_blks: U32,
    total_chunks: U32,
    image_checksum: U32,
}

impl RawFileHeader {
    fn new(block_size: u32, total_blocks: u32, total_chunks: u32) -> Self {
        Self {
            magic: U32::new(SPARSE_MAGIC),
            major_version: U16::new(MAJOR_VERSION),
            minor_version: U16::new(0),
            file_hdr_sz: U16::new(FILE_HEADER_LEN as u16),
            chunk_hdr_sz: U16::new(CHUNK_HEADER_LEN as u16),
            blk_sz: U32::new(block_size),
            total_blks: U32::new(total_blocks),
            total_chunks: U32::new(total_chunks),
            image_checksum: U32::new(0),
        }
    }
}

/// Raw on-disk chunk header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawChunkHeader {
    chunk_type: U16,
    reserved: U16,
    chunk_sz: U32,
    total_sz: U32,
}

const _: () = assert!(FILE_HEADER_LEN == 28 && CHUNK_HEADER_LEN == 12);

/// True if `bytes` starts with the sparse magic.
pub fn is_sparse(bytes: &[u8]) -> bool {
    U32::read_from_prefix(bytes).is_ok_and(|(magic, _)| magic.get() == SPARSE_MAGIC)
}

/// Expanded size announced by the file header.
pub fn declared_size(blob: &[u8]) -> Result<u64> {
    let header = FileHeader::parse(blob)?;
    Ok(header.block_size as u64 * header.total_blocks as u64)
}

/// Destination for expanded bytes, addressed relative to its own start.
pub trait Sink {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// True when unwritten bytes already read as zero, so zero fills may be skipped.
    fn zeroed(&self) -> bool {
        false
    }
}

impl Sink for [u8] {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let start = usize::try_from(offset).map_err(|_| malformed("offset overflow"))?;
        let end = start
            .checked_add(data.len())
            .filter(|end| *end <= self.len())
            .ok_or_else(|| malformed(format!("write past end of {} byte buffer", self.len())))?;
        self[start..end].copy_from_slice(data);
        Ok(())
    }
}

impl Sink for Vec<u8> {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.as_mut_slice().write_at(offset, data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Raw,
    Fill,
    Skip,
    Checksum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkData<'a> {
    Raw(&'a [u8]),
    Fill([u8; 4]),
    Skip,
    Checksum(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub output_size: u64,
    pub data: ChunkData<'a>,
}

impl Chunk<'_> {
    pub fn kind(&self) -> ChunkKind {
        match self.data {
            ChunkData::Raw(_) => ChunkKind::Raw,
            ChunkData::Fill(_) => ChunkKind::Fill,
            ChunkData::Skip => ChunkKind::Skip,
            ChunkData::Checksum(_) => ChunkKind::Checksum,
        }
    }
}

struct FileHeader {
    header_len: usize,
    chunk_header_len: usize,
    block_size: u32,
    total_blocks: u32,
    total_chunks: u32,
}

impl FileHeader {
    fn parse(bytes: &[u8]) -> Result<Self> {
        let (raw, _) = RawFileHeader::ref_from_prefix(bytes)
            .map_err(|_| malformed("truncated file header"))?;
        let magic = raw.magic.get();
        if magic != SPARSE_MAGIC {
            return Err(malformed(format!("bad magic {:#010x}", magic)));
        }
        let major = raw.major_version.get();
        if major != MAJOR_VERSION {
            return Err(malformed(format!("unsupported major version {}", major)));
        }

        let header = Self {
            header_len: raw.file_hdr_sz.get() as usize,
            chunk_header_len: raw.chunk_hdr_sz.get() as usize,
            block_size: raw.blk_sz.get(),
            total_blocks: raw.total_blks.get(),
            total_chunks: raw.total_chunks.get(),
        };
        if header.header_len < FILE_HEADER_LEN || header.chunk_header_len < CHUNK_HEADER_LEN {
            return Err(malformed("header sizes below minimum"));
        }
        if header.block_size == 0 || header.block_size % 4 != 0 {
            return Err(malformed(format!("invalid block size {}", header.block_size)));
        }
        Ok(header)
    }
}

/// A parsed chunk stream borrowing its payloads from the blob.
#[derive(Debug, Clone)]
pub struct SparseImage<'a> {
    pub block_size: u32,
    pub total_blocks: u32,
    pub chunks: Vec<Chunk<'a>>,
}

impl<'a> SparseImage<'a> {
    /// Parse and structurally validate a sparse blob.
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        let header = FileHeader::parse(bytes)?;
        let block_size = header.block_size as u64;

        let mut chunks = Vec::with_capacity(header.total_chunks.min(1 << 16) as usize);
        let mut pos = header.header_len;
        let mut blocks = 0u64;

        for i in 0..header.total_chunks {
            let head = bytes
                .get(pos..pos + header.chunk_header_len)
                .ok_or_else(|| malformed(format!("chunk {}: truncated header", i)))?;
            let (raw, _) = RawChunkHeader::ref_from_prefix(head)
                .map_err(|_| malformed(format!("chunk {}: truncated header", i)))?;
            let chunk_type = raw.chunk_type.get();
            let chunk_blocks = raw.chunk_sz.get() as u64;
            let total_len = raw.total_sz.get() as usize;

            let body_start = pos + header.chunk_header_len;
            let body = total_len
                .checked_sub(header.chunk_header_len)
                .and_then(|len| bytes.get(body_start..body_start + len))
                .ok_or_else(|| malformed(format!("chunk {}: truncated or inconsistent body", i)))?;

            let output_size = chunk_blocks * block_size;
            let data = match chunk_type {
                CHUNK_RAW => {
                    if body.len() as u64 != output_size {
                        return Err(malformed(format!(
                            "chunk {}: raw body is {} bytes, expected {}",
                            i,
                            body.len(),
                            output_size
                        )));
                    }
                    ChunkData::Raw(body)
                }
                CHUNK_FILL => {
                    let pattern: [u8; 4] = body
                        .try_into()
                        .map_err(|_| malformed(format!("chunk {}: fill body is not 4 bytes", i)))?;
                    ChunkData::Fill(pattern)
                }
                CHUNK_DONT_CARE => {
                    if !body.is_empty() {
                        return Err(malformed(format!("chunk {}: skip chunk carries data", i)));
                    }
                    ChunkData::Skip
                }
                CHUNK_CRC32 => {
                    if body.len() != 4 || chunk_blocks != 0 {
                        return Err(malformed(format!("chunk {}: malformed checksum chunk", i)));
                    }
                    let (crc, _) = U32::read_from_prefix(body)
                        .map_err(|_| malformed(format!("chunk {}: malformed checksum chunk", i)))?;
                    ChunkData::Checksum(crc.get())
                }
                other => {
                    return Err(malformed(format!("chunk {}: unknown type {:#06x}", i, other)));
                }
            };

            chunks.push(Chunk { output_size, data });
            blocks += chunk_blocks;
            pos += total_len;
        }

        if blocks != header.total_blocks as u64 {
            return Err(malformed(format!(
                "chunks cover {} blocks, header declares {}",
                blocks, header.total_blocks
            )));
        }
        if pos < bytes.len() {
            debug!("ignoring {} trailing bytes after sparse chunks", bytes.len() - pos);
        }

        Ok(Self {
            block_size: header.block_size,
            total_blocks: header.total_blocks,
            chunks,
        })
    }

    /// Size of the fully expanded image.
    pub fn expanded_size(&self) -> u64 {
        self.block_size as u64 * self.total_blocks as u64
    }

    /// Bytes that expansion physically writes (raw and non-zero fill chunks).
    pub fn written_size(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| match c.data {
                ChunkData::Raw(_) => true,
                ChunkData::Fill(p) => p != [0; 4],
                _ => false,
            })
            .map(|c| c.output_size)
            .sum()
    }

    /// Expand into `sink`, which must be `declared_size` bytes long.
    ///
    /// Returns the number of bytes the image covers.
    pub fn expand_into<S: Sink + ?Sized>(&self, declared_size: u64, sink: &mut S) -> Result<u64> {
        let total: u64 = self.chunks.iter().map(|c| c.output_size).sum();
        if total != declared_size {
            return Err(malformed(format!(
                "chunks expand to {} bytes, expected {}",
                total, declared_size
            )));
        }

        let verify = self
            .chunks
            .iter()
            .any(|c| c.kind() == ChunkKind::Checksum);
        let mut crc = crc32fast::Hasher::new();
        let mut cursor = 0u64;

        for (i, chunk) in self.chunks.iter().enumerate() {
            match chunk.data {
                ChunkData::Raw(bytes) => {
                    sink.write_at(cursor, bytes)?;
                    if verify {
                        crc.update(bytes);
                    }
                }
                ChunkData::Fill(pattern) => {
                    let write = pattern != [0; 4] || !sink.zeroed();
                    if write || verify {
                        let buf = pattern_buffer(pattern, chunk.output_size);
                        for_each_piece(chunk.output_size, buf.len(), |at, len| {
                            if verify {
                                crc.update(&buf[..len]);
                            }
                            if write {
                                sink.write_at(cursor + at, &buf[..len])?;
                            }
                            Ok(())
                        })?;
                    }
                }
                ChunkData::Skip => {
                    if verify {
                        let zeros = pattern_buffer([0; 4], chunk.output_size);
                        for_each_piece(chunk.output_size, zeros.len(), |_, len| {
                            crc.update(&zeros[..len]);
                            Ok(())
                        })?;
                    }
                }
                ChunkData::Checksum(expected) => {
                    let actual = std::mem::replace(&mut crc, crc32fast::Hasher::new()).finalize();
                    if actual != expected {
                        return Err(malformed(format!(
                            "chunk {}: checksum {:#010x} does not match computed {:#010x}",
                            i, expected, actual
                        )));
                    }
                }
            }
            cursor += chunk.output_size;
        }

        Ok(cursor)
    }
}

fn pattern_buffer(pattern: [u8; 4], output_size: u64) -> Vec<u8> {
    let len = output_size.min(FILL_BUFFER_LEN as u64) as usize;
    pattern.iter().copied().cycle().take(len).collect()
}

/// Call `f(offset, len)` for consecutive pieces of at most `piece` bytes covering `total`.
fn for_each_piece(
    total: u64,
    piece: usize,
    mut f: impl FnMut(u64, usize) -> Result<()>,
) -> Result<()> {
    let mut at = 0u64;
    while at < total {
        let len = (total - at).min(piece as u64) as usize;
        f(at, len)?;
        at += len as u64;
    }
    Ok(())
}

/// Expand `blob` into a buffer of exactly `declared_size` bytes.
pub fn expand(blob: &[u8], declared_size: u64) -> Result<Vec<u8>> {
    let image = SparseImage::parse(blob)?;
    let len = usize::try_from(declared_size)
        .map_err(|_| malformed(format!("{} bytes do not fit in memory", declared_size)))?;
    let mut out = vec![0u8; len];
    image.expand_into(declared_size, out.as_mut_slice())?;
    Ok(out)
}

/// Options for [`encode`].
#[derive(Debug, Clone, Copy)]
pub struct EncodeOptions {
    pub block_size: u32,
    /// Append a CRC32 chunk covering the whole image.
    pub checksum: bool,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            checksum: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockClass {
    Zero,
    Fill([u8; 4]),
    Raw,
}

fn classify(block: &[u8]) -> BlockClass {
    let first: [u8; 4] = [block[0], block[1], block[2], block[3]];
    if !block.chunks_exact(4).all(|w| w == first) {
        BlockClass::Raw
    } else if first == [0; 4] {
        BlockClass::Zero
    } else {
        BlockClass::Fill(first)
    }
}

/// Re-encode raw bytes into the sparse format.
///
/// Zero blocks become skip chunks, uniform blocks become fill chunks, and
/// everything else is stored raw. `data` must be a whole number of blocks.
pub fn encode(data: &[u8], options: EncodeOptions) -> Result<Vec<u8>> {
    let bs = options.block_size as usize;
    if bs == 0 || bs % 4 != 0 {
        return Err(malformed(format!("invalid block size {}", bs)));
    }
    if data.len() % bs != 0 {
        return Err(malformed(format!(
            "{} bytes is not a whole number of {} byte blocks",
            data.len(),
            bs
        )));
    }
    let total_blocks = u32::try_from(data.len() / bs)
        .map_err(|_| malformed("image has too many blocks"))?;
    let max_run = (MAX_RUN_BYTES / bs as u64).max(1) as usize;

    let mut body = Vec::new();
    let mut chunk_count = 0u32;
    let mut emit = |class: BlockClass, blocks: &[u8]| {
        let n_blocks = (blocks.len() / bs) as u32;
        match class {
            BlockClass::Raw => push_chunk(&mut body, CHUNK_RAW, n_blocks, blocks),
            BlockClass::Fill(p) => push_chunk(&mut body, CHUNK_FILL, n_blocks, &p[..]),
            BlockClass::Zero => push_chunk(&mut body, CHUNK_DONT_CARE, n_blocks, &[][..]),
        }
        chunk_count += 1;
    };

    let blocks: Vec<&[u8]> = data.chunks_exact(bs).collect();
    let mut i = 0;
    while i < blocks.len() {
        let class = classify(blocks[i]);
        let mut j = i + 1;
        while j < blocks.len() && j - i < max_run && classify(blocks[j]) == class {
            j += 1;
        }
        emit(class, &data[i * bs..j * bs]);
        i = j;
    }

    if options.checksum {
        let crc = crc32fast::hash(data);
        push_chunk(&mut body, CHUNK_CRC32, 0, &crc.to_le_bytes());
        chunk_count += 1;
    }

    let mut out = Vec::with_capacity(FILE_HEADER_LEN + body.len());
    out.extend_from_slice(RawFileHeader::new(options.block_size, total_blocks, chunk_count).as_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

fn push_chunk(out: &mut Vec<u8>, chunk_type: u16, blocks: u32, payload: &[u8]) {
    let header = RawChunkHeader {
        chunk_type: U16::new(chunk_type),
        reserved: U16::new(0),
        chunk_sz: U32::new(blocks),
        total_sz: U32::new((CHUNK_HEADER_LEN + payload.len()) as u32),
    };
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);
}
