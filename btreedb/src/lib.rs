#![warn(missing_docs)]
//! BTreeDB5 containers
//!
//! # Implementation Details
//!
//! Provides an embedded, single-file, ordered key/value store. Keys are
//! fixed-width byte strings; values are opaque byte payloads.
//!
//! A container is one memory-mapped file: a 512-byte header followed by a
//! pool of fixed-size blocks. Records live in the leaves of a B-tree whose
//! inner nodes carry fixed-width keys and 32-bit block pointers. A leaf
//! that outgrows a single block continues into further blocks through a
//! `next` pointer, so values much larger than the block size are fine.
//!
//! Mutations never touch a live block. Every rewrite goes to a freshly
//! allocated block and the replaced block is handed to the free-list, so
//! the tree reachable from the committed root stays intact while you work.
//! [`commit`](btree::BTreeDb::commit) publishes the working tree by writing
//! the inactive root descriptor in the header and flipping the active-root
//! bit; [`rollback`](btree::BTreeDb::rollback) re-reads the header and
//! discards everything since the last commit. A process killed mid-write
//! reopens to the last committed snapshot.
//!
//! Reclaimed blocks are kept in an on-disk chain of free blocks, so space
//! is reused across sessions without any sidecar files.
//!
//! The user experience should be similar to working with a `BTreeMap`
//! whose contents happen to survive a restart.

pub mod btree;
mod io;
