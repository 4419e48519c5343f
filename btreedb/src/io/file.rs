//! File functions
//!
//! The file has the following structure
//!
//! Header
//!   [Block]
//!
//! The Header is a fixed-size region at the start of the file. Blocks are
//! fixed-size regions following it, addressed by a 32-bit index. The whole
//! file is memory mapped; growing or shrinking the pool replaces the
//! mapping, which invalidates every outstanding block slice. Callers must
//! re-fetch slices after any operation that can change the capacity.

use std::fs::{File, OpenOptions};
use std::path::Path;

use anyhow::Result;
use memmap2::{MmapMut, MmapOptions};
use thiserror::Error;

#[derive(Debug)]
pub(crate) struct BlockFile {
    file: File,
    map: MmapMut,
    header_size: usize,
    block_size: usize,
    blocks: usize,
}

#[derive(Error, Debug)]
pub enum BlockFileError {
    #[error("block size {0} does not divide data region of {1} bytes")]
    NotAMultiple(usize, usize),

    #[error("block size must be set before accessing blocks")]
    BlockSizeUnset,

    #[error("block {0} is beyond capacity {1}")]
    OutOfRange(u32, usize),
}

impl BlockFile {
    /// Create a block file, truncating any existing content, and map it
    /// read/write.
    pub(crate) fn create(path: &Path, header_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Self::map(file, header_size)
    }

    /// Open (creating if necessary) a block file, ensuring it is at least
    /// `header_size` bytes long, and map it read/write.
    pub(crate) fn open(path: &Path, header_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Self::map(file, header_size)
    }

    fn map(file: File, header_size: usize) -> Result<Self> {
        let len = file.metadata()?.len();
        if len < header_size as u64 {
            file.set_len(header_size as u64)?;
        }

        let map = unsafe { MmapOptions::new().map_mut(&file)? };

        Ok(Self {
            file,
            map,
            header_size,
            block_size: 0,
            blocks: 0,
        })
    }

    /// Set the block size. The data region must divide evenly.
    pub(crate) fn set_block_size(&mut self, block_size: usize) -> Result<()> {
        let data = self.map.len() - self.header_size;
        if block_size == 0 || data % block_size != 0 {
            return Err(BlockFileError::NotAMultiple(block_size, data).into());
        }
        self.block_size = block_size;
        self.blocks = data / block_size;
        Ok(())
    }

    /// Number of whole blocks currently present.
    pub(crate) fn capacity(&self) -> usize {
        self.blocks
    }

    pub(crate) fn header(&self) -> &[u8] {
        &self.map[..self.header_size]
    }

    pub(crate) fn header_mut(&mut self) -> &mut [u8] {
        &mut self.map[..self.header_size]
    }

    pub(crate) fn block(&self, ptr: u32) -> Result<&[u8]> {
        let (start, end) = self.block_span(ptr)?;
        Ok(&self.map[start..end])
    }

    pub(crate) fn block_mut(&mut self, ptr: u32) -> Result<&mut [u8]> {
        let (start, end) = self.block_span(ptr)?;
        Ok(&mut self.map[start..end])
    }

    fn block_span(&self, ptr: u32) -> Result<(usize, usize)> {
        if self.block_size == 0 {
            return Err(BlockFileError::BlockSizeUnset.into());
        }
        if ptr as usize >= self.blocks {
            return Err(BlockFileError::OutOfRange(ptr, self.blocks).into());
        }
        let start = self.header_size + ptr as usize * self.block_size;
        Ok((start, start + self.block_size))
    }

    /// Append `n` blocks to the pool.
    pub(crate) fn grow(&mut self, n: usize) -> Result<()> {
        self.remap(self.blocks + n)
    }

    /// Set the pool to exactly `n` blocks, truncating or extending.
    pub(crate) fn resize(&mut self, n: usize) -> Result<()> {
        self.remap(n)
    }

    fn remap(&mut self, blocks: usize) -> Result<()> {
        if self.block_size == 0 {
            return Err(BlockFileError::BlockSizeUnset.into());
        }
        let len = (self.header_size + blocks * self.block_size) as u64;

        // The old mapping must be released before the file shrinks.
        self.map.flush()?;
        self.map = MmapMut::map_anon(1)?;
        self.file.set_len(len)?;
        self.map = unsafe { MmapOptions::new().map_mut(&self.file)? };
        self.blocks = blocks;
        Ok(())
    }

    pub(crate) fn flush(&self) -> Result<()> {
        self.map.flush().map_err(|e| e.into())
    }
}
