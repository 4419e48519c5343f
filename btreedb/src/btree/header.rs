//! The 512-byte file header
//!
//! Layout (big-endian throughout):
//!
//! | offset | size | field                              |
//! |--------|------|------------------------------------|
//! | 0      | 8    | magic `"BTreeDB5"`                 |
//! | 8      | 4    | block size                         |
//! | 12     | 16   | identifier, zero padded            |
//! | 28     | 4    | key size                           |
//! | 32     | 1    | `use_alt_root` flag                |
//! | 33     | 17   | primary root descriptor            |
//! | 50     | 17   | alternate root descriptor          |
//!
//! A root descriptor is: free-list head pointer (4), advisory device size
//! (8), root block pointer (4), root-is-leaf flag (1). Exactly one
//! descriptor is live at a time; the other is the previous snapshot.

use anyhow::Result;
use thiserror::Error;

use super::node::NIL;

pub(crate) const HEADER_SIZE: usize = 512;

const MAGIC: &[u8; 8] = b"BTreeDB5";

const IDENTIFIER_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("file magic is not BTreeDB5")]
    BadMagic,

    #[error("identifier longer than {IDENTIFIER_LEN} bytes")]
    IdentifierTooLong,

    #[error("invalid {0}: {1}")]
    InvalidField(&'static str, i64),
}

/// One of the two root descriptors held in the header.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct RootDescriptor {
    pub free_head: u32,
    pub device_size: i64,
    pub root: u32,
    pub root_is_leaf: bool,
}

impl RootDescriptor {
    fn read(buf: &[u8]) -> Self {
        Self {
            free_head: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            device_size: i64::from_be_bytes(buf[4..12].try_into().unwrap()),
            root: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
            root_is_leaf: buf[16] != 0,
        }
    }

    fn write(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.free_head.to_be_bytes());
        buf[4..12].copy_from_slice(&self.device_size.to_be_bytes());
        buf[12..16].copy_from_slice(&self.root.to_be_bytes());
        buf[16] = self.root_is_leaf as u8;
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Header {
    pub block_size: usize,
    pub identifier: String,
    pub key_size: usize,
    pub use_alt_root: bool,
    pub roots: [RootDescriptor; 2],
}

impl Header {
    pub(crate) fn new(identifier: &str, block_size: usize, key_size: usize) -> Result<Self> {
        if identifier.len() > IDENTIFIER_LEN {
            return Err(HeaderError::IdentifierTooLong.into());
        }
        Ok(Self {
            block_size,
            identifier: identifier.to_string(),
            key_size,
            use_alt_root: false,
            roots: [
                RootDescriptor {
                    free_head: NIL,
                    device_size: HEADER_SIZE as i64,
                    root: NIL,
                    root_is_leaf: true,
                },
                RootDescriptor {
                    free_head: NIL,
                    device_size: HEADER_SIZE as i64,
                    root: NIL,
                    root_is_leaf: true,
                },
            ],
        })
    }

    /// Parse a header, validating the magic and geometry fields.
    pub(crate) fn read(buf: &[u8]) -> Result<Self> {
        if &buf[0..8] != MAGIC {
            return Err(HeaderError::BadMagic.into());
        }

        let block_size = i32::from_be_bytes(buf[8..12].try_into().unwrap());
        if block_size <= 0 {
            return Err(HeaderError::InvalidField("block size", block_size as i64).into());
        }

        let len = buf[12..28]
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(IDENTIFIER_LEN);
        let identifier = String::from_utf8_lossy(&buf[12..12 + len]).into_owned();

        let key_size = i32::from_be_bytes(buf[28..32].try_into().unwrap());
        if key_size <= 0 {
            return Err(HeaderError::InvalidField("key size", key_size as i64).into());
        }

        Ok(Self {
            block_size: block_size as usize,
            identifier,
            key_size: key_size as usize,
            use_alt_root: buf[32] != 0,
            roots: [
                RootDescriptor::read(&buf[33..50]),
                RootDescriptor::read(&buf[50..67]),
            ],
        })
    }

    pub(crate) fn write(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(MAGIC);
        buf[8..12].copy_from_slice(&(self.block_size as i32).to_be_bytes());
        buf[12..28].fill(0);
        buf[12..12 + self.identifier.len()].copy_from_slice(self.identifier.as_bytes());
        buf[28..32].copy_from_slice(&(self.key_size as i32).to_be_bytes());
        buf[32] = self.use_alt_root as u8;
        self.roots[0].write(&mut buf[33..50]);
        self.roots[1].write(&mut buf[50..67]);
    }

    /// Index of the live root descriptor.
    pub(crate) fn live(&self) -> usize {
        self.use_alt_root as usize
    }

    /// Index of the inactive root descriptor, the target of the next commit.
    pub(crate) fn inactive(&self) -> usize {
        !self.use_alt_root as usize
    }
}
