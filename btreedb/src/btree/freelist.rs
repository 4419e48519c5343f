//! Block allocation and the persistent free-list
//!
//! Reclaimed blocks live in an on-disk chain of free blocks headed by the
//! live root descriptor. On top of that chain the allocator keeps three
//! in-memory sets describing the current transaction:
//!
//! * `used` — blocks handed out since the last commit. They back the
//!   working tree and nothing committed refers to them.
//! * `available` — blocks that may be overwritten right now: blocks the
//!   committed free-list already exposed (pulled in from the chain), and
//!   blocks that were both allocated and freed inside this transaction.
//! * `pending` — blocks freed this transaction that the committed
//!   snapshot still references, plus chain blocks consumed while
//!   refilling `available`. Touching these before the next root flip
//!   would invalidate the committed snapshot, so they only return to
//!   circulation when a commit folds them back into the chain.
//!
//! Keeping `pending` out of the allocation pool is what makes every
//! transaction a whole-tree snapshot: the committed root keeps pointing
//! at intact blocks no matter how much the working tree churns.

use std::collections::HashSet;

use anyhow::Result;

use super::node::{read_free, write_free, Geometry, NIL};
use super::store::StoreError;
use crate::io::file::BlockFile;

#[derive(Debug)]
pub(crate) struct FreeList {
    head: u32,
    used: HashSet<u32>,
    available: HashSet<u32>,
    pending: HashSet<u32>,
}

impl FreeList {
    pub(crate) fn new(head: u32) -> Self {
        Self {
            head,
            used: HashSet::new(),
            available: HashSet::new(),
            pending: HashSet::new(),
        }
    }

    /// Head of the on-disk free-block chain.
    pub(crate) fn head(&self) -> u32 {
        self.head
    }

    pub(crate) fn set_head(&mut self, head: u32) {
        self.head = head;
    }

    /// Allocate a block: reuse one that is safe to overwrite, refill from
    /// the on-disk chain, or grow the file by one block.
    pub(crate) fn pop(&mut self, file: &mut BlockFile, geom: Geometry) -> Result<u32> {
        loop {
            if let Some(ptr) = self.available.iter().next().copied() {
                self.available.remove(&ptr);
                self.used.insert(ptr);
                return Ok(ptr);
            }

            if self.head != NIL {
                let node = self.head;
                let (next, ptrs) = read_free(file, geom, node)?;
                tracing::debug!(block = node, reclaimed = ptrs.len(), "consuming free block");
                self.available.extend(ptrs);
                // The chain block itself only becomes reusable after the
                // next commit re-links the chain.
                self.pending.insert(node);
                self.head = next;
                continue;
            }

            let ptr = file.capacity();
            if ptr as u64 >= NIL as u64 {
                return Err(StoreError::CapacityExhausted.into());
            }
            file.grow(1)?;
            let ptr = ptr as u32;
            self.used.insert(ptr);
            return Ok(ptr);
        }
    }

    /// Return a block to the allocator. Blocks allocated in this
    /// transaction become reusable immediately; anything else waits for
    /// the next commit. Safe to call twice with the same pointer.
    pub(crate) fn push(&mut self, ptr: u32) {
        if ptr == NIL || self.available.contains(&ptr) || self.pending.contains(&ptr) {
            return;
        }
        if self.used.remove(&ptr) {
            self.available.insert(ptr);
        } else {
            self.pending.insert(ptr);
        }
    }

    /// Forget all transaction state. The on-disk chain is untouched.
    pub(crate) fn clear(&mut self) {
        self.used.clear();
        self.available.clear();
        self.pending.clear();
    }

    /// Fold every freed block back into the on-disk chain, batching up to
    /// `free_max` pointers per free block. Called during commit, after the
    /// root flip; the new head must then be persisted by the caller.
    pub(crate) fn fold(&mut self, file: &mut BlockFile, geom: Geometry) -> Result<()> {
        let mut freed: Vec<u32> = self.pending.drain().chain(self.available.drain()).collect();
        freed.sort_unstable();

        while !freed.is_empty() {
            if self.head != NIL {
                let (next, mut ptrs) = read_free(file, geom, self.head)?;
                if ptrs.len() < geom.free_max() {
                    let take = (geom.free_max() - ptrs.len()).min(freed.len());
                    ptrs.extend(freed.drain(..take));
                    write_free(file, geom, self.head, next, &ptrs)?;
                    continue;
                }
            }

            // Chain absent or head full: one freed block becomes the new
            // head and carries a batch of the others.
            let node = freed.pop().unwrap();
            let take = freed.len().min(geom.free_max());
            let batch: Vec<u32> = freed.drain(..take).collect();
            write_free(file, geom, node, self.head, &batch)?;
            self.head = node;
        }

        self.used.clear();
        Ok(())
    }

    /// In-memory sets, for consistency checking.
    pub(crate) fn uncommitted(&self) -> (&HashSet<u32>, &HashSet<u32>, &HashSet<u32>) {
        (&self.used, &self.available, &self.pending)
    }
}
