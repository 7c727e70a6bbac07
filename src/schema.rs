//! Static schema table: what the file format itself does not tell us.
//!
//! 3.x blocks carry only a tag and a total length; the number of address
//! links that follow the 4-byte header is fixed per tag, with a handful of
//! content-conditional extras handled by the resolver. 4.x blocks are
//! self-describing (the link count sits in the 24-byte header), so the
//! table only maps tags to kinds there.
//!
//! A lookup miss is fatal by contract: a tag we cannot size would desync
//! every block after it.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::{Result, SortError};

// ── Byte order ───────────────────────────────────────────────────────────────

/// Byte order of the file body. The 3.x identification block may select
/// big-endian; 4.x files are always little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    #[inline]
    pub fn u16(self, b: &[u8]) -> u16 {
        match self {
            Endian::Little => LittleEndian::read_u16(b),
            Endian::Big => BigEndian::read_u16(b),
        }
    }

    #[inline]
    pub fn u32(self, b: &[u8]) -> u32 {
        match self {
            Endian::Little => LittleEndian::read_u32(b),
            Endian::Big => BigEndian::read_u32(b),
        }
    }

    #[inline]
    pub fn u64(self, b: &[u8]) -> u64 {
        match self {
            Endian::Little => LittleEndian::read_u64(b),
            Endian::Big => BigEndian::read_u64(b),
        }
    }

    /// Read an unsigned integer of 1..=8 bytes.
    #[inline]
    pub fn uint(self, b: &[u8], width: usize) -> u64 {
        match self {
            Endian::Little => LittleEndian::read_uint(b, width),
            Endian::Big => BigEndian::read_uint(b, width),
        }
    }

    #[inline]
    pub fn put_u16(self, b: &mut [u8], v: u16) {
        match self {
            Endian::Little => LittleEndian::write_u16(b, v),
            Endian::Big => BigEndian::write_u16(b, v),
        }
    }

    #[inline]
    pub fn put_u32(self, b: &mut [u8], v: u32) {
        match self {
            Endian::Little => LittleEndian::write_u32(b, v),
            Endian::Big => BigEndian::write_u32(b, v),
        }
    }

    #[inline]
    pub fn put_u64(self, b: &mut [u8], v: u64) {
        match self {
            Endian::Little => LittleEndian::write_u64(b, v),
            Endian::Big => BigEndian::write_u64(b, v),
        }
    }
}

// ── Schema family ────────────────────────────────────────────────────────────

/// Which of the two schema families the identification block selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// MDF 3.x: 4-byte header (tag + u16 length), u32 links, link counts
    /// from the table below.
    V3,
    /// MDF 4.x: 24-byte header with embedded u64 length and link count,
    /// u64 links, 8-byte block alignment.
    V4,
}

// ── Block kinds ──────────────────────────────────────────────────────────────

/// Specialized identity of a block once its tag is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Header,
    DataGroup,
    ChannelGroup,
    Channel,
    Conversion,
    Dependency,
    Text,
    Metadata,
    /// Raw record bytes. Headerless in 3.x (length computed from sibling
    /// channel groups), a real DT block in 4.x.
    RawData,
    Trigger,
    // 4.x structural kinds, carried verbatim.
    FileHistory,
    Hierarchy,
    Attachment,
    Event,
    SourceInfo,
    Array,
    SampleReduction,
    SignalData,
    DataList,
    ListHeader,
    CompressedData,
}

// ── Field and link offsets ───────────────────────────────────────────────────

// 3.x layout. Offsets are from block start (header included).
pub const V3_HD_DG_COUNT_OFFSET: u64 = 16;
pub const V3_DG_CG_COUNT_OFFSET: u64 = 20;
pub const V3_DG_REC_ID_COUNT_OFFSET: u64 = 22;
pub const V3_CG_RECORD_ID_OFFSET: u64 = 16;
pub const V3_CG_RECORD_SIZE_OFFSET: u64 = 20;
pub const V3_CG_CYCLE_COUNT_OFFSET: u64 = 22;
/// Length of a freshly synthesized 3.x data group block.
pub const V3_DG_BLOCK_LEN: u16 = 28;

// 4.x layout. The data section of a 4.x block starts after its link list,
// so field offsets are relative to 24 + 8 * link_count.
pub const V4_HEADER_LEN: u64 = 24;
pub const V4_DG_REC_ID_WIDTH_REL: u64 = 0;
pub const V4_CG_RECORD_ID_REL: u64 = 0;
pub const V4_CG_CYCLE_COUNT_REL: u64 = 8;
pub const V4_CG_FLAGS_REL: u64 = 16;
pub const V4_CG_DATA_BYTES_REL: u64 = 24;
pub const V4_CG_INVAL_BYTES_REL: u64 = 28;
/// Bit 0 of the 4.x channel group flags: variable-length signal data.
pub const V4_CG_FLAG_VLSD: u16 = 0x0001;
/// Length of a freshly synthesized 4.x data group block.
pub const V4_DG_BLOCK_LEN: u64 = 64;

/// Link index of the next-group link in DG and the next-channel-group link
/// in CG (both families).
pub const LINK_NEXT: usize = 0;
/// Link index of the first-channel-group link in DG (both families).
pub const LINK_CG_FIRST: usize = 1;

// ── Schema ───────────────────────────────────────────────────────────────────

/// Per-run schema context: family, byte order and the static tables.
#[derive(Debug, Clone, Copy)]
pub struct Schema {
    pub family: Family,
    pub endian: Endian,
    pub version: u16,
}

impl Schema {
    pub fn new(family: Family, endian: Endian, version: u16) -> Self {
        Self { family, endian, version }
    }

    /// Width in bytes of one address link field.
    #[inline]
    pub fn link_width(&self) -> usize {
        match self.family {
            Family::V3 => 4,
            Family::V4 => 8,
        }
    }

    /// Link index of the data-section link of a data group.
    #[inline]
    pub fn dg_data_link(&self) -> usize {
        match self.family {
            Family::V3 => 3,
            Family::V4 => 2,
        }
    }

    /// Base link count of a 3.x tag. Content-conditional extras (CG/CN/CC/CD)
    /// are discovered by the resolver on top of this.
    pub fn base_link_count(&self, tag: &[u8; 2]) -> Result<usize> {
        let n = match tag {
            b"HD" => 3,
            b"DG" => 4,
            b"CG" => 3,
            b"CN" => 5,
            b"TR" => 1,
            b"CC" | b"CD" | b"TX" | b"PR" => 0,
            _ => return Err(unknown_tag(tag)),
        };
        Ok(n)
    }

    /// Map a tag to its specialized kind.
    pub fn kind_of(&self, tag: &[u8; 2]) -> Result<Kind> {
        let kind = match self.family {
            Family::V3 => match tag {
                b"HD" => Kind::Header,
                b"DG" => Kind::DataGroup,
                b"CG" => Kind::ChannelGroup,
                b"CN" => Kind::Channel,
                b"CC" => Kind::Conversion,
                b"CD" => Kind::Dependency,
                b"TX" => Kind::Text,
                b"PR" => Kind::Metadata,
                b"TR" => Kind::Trigger,
                b"DT" => Kind::RawData,
                _ => return Err(unknown_tag(tag)),
            },
            Family::V4 => match tag {
                b"HD" => Kind::Header,
                b"FH" => Kind::FileHistory,
                b"CH" => Kind::Hierarchy,
                b"AT" => Kind::Attachment,
                b"EV" => Kind::Event,
                b"DG" => Kind::DataGroup,
                b"CG" => Kind::ChannelGroup,
                b"SI" => Kind::SourceInfo,
                b"CN" => Kind::Channel,
                b"CC" => Kind::Conversion,
                b"CA" => Kind::Array,
                b"TX" => Kind::Text,
                b"MD" => Kind::Metadata,
                b"DT" => Kind::RawData,
                b"SD" => Kind::SignalData,
                b"RD" => Kind::RawData,
                b"SR" => Kind::SampleReduction,
                b"DL" => Kind::DataList,
                b"HL" => Kind::ListHeader,
                b"DZ" => Kind::CompressedData,
                _ => return Err(unknown_tag(tag)),
            },
        };
        Ok(kind)
    }
}

fn unknown_tag(tag: &[u8; 2]) -> SortError {
    SortError::UnknownTag { tag: String::from_utf8_lossy(tag).into_owned() }
}
