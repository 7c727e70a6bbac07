//! The 64-byte identification block at the start of every MDF file.
//!
//! The id block is the only structure read before the schema family is
//! known. Its own multi-byte fields are always little-endian; the byte-order
//! flag it carries governs the rest of the file (3.x only — 4.x files are
//! little-endian throughout).

use std::io::Read;

use tracing::{debug, warn};

use crate::error::{Result, SortError};
use crate::schema::{Endian, Family};

/// Fixed size of the identification block.
pub const ID_BLOCK_LEN: usize = 64;

pub const MAGIC: &[u8; 8] = b"MDF     ";

/// Parsed identification block. `raw` keeps the verbatim bytes so the writer
/// can copy the block unchanged.
#[derive(Debug, Clone)]
pub struct IdBlock {
    pub raw: [u8; ID_BLOCK_LEN],
    pub version: u16,
    pub version_str: String,
    pub family: Family,
    pub endian: Endian,
}

impl IdBlock {
    /// Read and validate the identification block.
    ///
    /// Versions 300..=399 select the 3.x schema family (byte-order flag
    /// honored), 400..=411 the 4.x family. Anything else is rejected before
    /// any output is attempted.
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut raw = [0u8; ID_BLOCK_LEN];
        reader.read_exact(&mut raw)?;

        if &raw[0..8] != MAGIC {
            return Err(SortError::InvalidMagic);
        }

        let version_str: String = raw[8..16]
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| b as char)
            .collect();

        // Id-block fields are little-endian regardless of the file flag.
        let order_flag = u16::from_le_bytes([raw[24], raw[25]]);
        let version = u16::from_le_bytes([raw[28], raw[29]]);

        let (family, endian) = match version {
            300..=399 => {
                let endian = if order_flag != 0 { Endian::Big } else { Endian::Little };
                (Family::V3, endian)
            }
            400..=411 => (Family::V4, Endian::Little),
            _ => return Err(SortError::UnsupportedVersion { version }),
        };

        if version == 330 {
            let code_page = u16::from_le_bytes([raw[30], raw[31]]);
            if code_page != 0 {
                warn!(code_page, "code page declared in id block is ignored, ISO-8859-1 assumed");
            }
        }

        debug!(version, %version_str, ?family, ?endian, "identified MDF file");

        Ok(Self { raw, version, version_str, family, endian })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn id_bytes(version: u16, order_flag: u16) -> [u8; ID_BLOCK_LEN] {
        let mut raw = [0u8; ID_BLOCK_LEN];
        raw[0..8].copy_from_slice(MAGIC);
        raw[8..11].copy_from_slice(b"3.3");
        raw[24..26].copy_from_slice(&order_flag.to_le_bytes());
        raw[28..30].copy_from_slice(&version.to_le_bytes());
        raw
    }

    #[test]
    fn accepts_v3_little_endian() {
        let id = IdBlock::read(&mut Cursor::new(id_bytes(330, 0))).unwrap();
        assert_eq!(id.family, Family::V3);
        assert_eq!(id.endian, Endian::Little);
        assert_eq!(id.version, 330);
    }

    #[test]
    fn accepts_v3_big_endian_flag() {
        let id = IdBlock::read(&mut Cursor::new(id_bytes(300, 1))).unwrap();
        assert_eq!(id.endian, Endian::Big);
    }

    #[test]
    fn accepts_v4() {
        let id = IdBlock::read(&mut Cursor::new(id_bytes(410, 0))).unwrap();
        assert_eq!(id.family, Family::V4);
        assert_eq!(id.endian, Endian::Little);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut raw = id_bytes(330, 0);
        raw[0] = b'X';
        assert!(matches!(
            IdBlock::read(&mut Cursor::new(raw)),
            Err(SortError::InvalidMagic)
        ));
    }

    #[test]
    fn rejects_out_of_range_versions() {
        for v in [212u16, 299, 412, 500] {
            assert!(matches!(
                IdBlock::read(&mut Cursor::new(id_bytes(v, 0))),
                Err(SortError::UnsupportedVersion { version }) if version == v
            ));
        }
    }
}
