//! Cached byte-range access to one data section.
//!
//! Record scanning reads a couple of bytes per record; going through the
//! OS for each id would dominate the run. The reader keeps the last-read
//! window and serves repeat requests from it.

use std::io::{Read, Seek, SeekFrom};

use crate::error::{Result, SortError};
use crate::schema::Endian;

/// Size of the cached window.
const WINDOW: usize = 64 * 1024;

pub struct CachedReader<'a, R: Read + Seek> {
    src: &'a mut R,
    /// Absolute file offset of the section start.
    base: u64,
    /// Section length in bytes; requests beyond it are refused.
    len: u64,
    window: Vec<u8>,
    /// Section-relative offset of `window[0]`.
    window_start: u64,
}

impl<'a, R: Read + Seek> CachedReader<'a, R> {
    pub fn new(src: &'a mut R, base: u64, len: u64) -> Self {
        Self { src, base, len, window: Vec::new(), window_start: 0 }
    }

    pub fn section_len(&self) -> u64 {
        self.len
    }

    /// Serve `len` bytes at section-relative `offset`.
    pub fn read(&mut self, offset: u64, len: usize) -> Result<&[u8]> {
        if offset + len as u64 > self.len {
            return Err(SortError::Corrupt(format!(
                "read of {len} bytes at section offset {offset:#x} exceeds section length {}",
                self.len
            )));
        }
        let in_window = offset >= self.window_start
            && offset + len as u64 <= self.window_start + self.window.len() as u64;
        if !in_window {
            let span = (self.len - offset).min(WINDOW.max(len) as u64) as usize;
            self.src.seek(SeekFrom::Start(self.base + offset))?;
            self.window.resize(span, 0);
            self.src.read_exact(&mut self.window)?;
            self.window_start = offset;
        }
        let start = (offset - self.window_start) as usize;
        Ok(&self.window[start..start + len])
    }

    /// Read an unsigned integer of 1..=8 bytes.
    pub fn read_uint(&mut self, offset: u64, width: usize, endian: Endian) -> Result<u64> {
        let bytes = self.read(offset, width)?;
        Ok(endian.uint(bytes, width))
    }
}
