//! The container engine
//!
//! This is the main data structure exposed by the library.

use std::collections::HashSet;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Result};
use futures::StreamExt;
use strum::EnumString;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use super::freelist::FreeList;
use super::header::{Header, RootDescriptor, HEADER_SIZE};
use super::node::{
    encode_records, leaf_blocks_needed, read_free, write_leaf_chain, CodecError, Geometry,
    IndexNode, LeafNode, Record, NIL,
};
use crate::io::file::BlockFile;

/// When accessing container contents serially, ascending or descending order.
#[derive(Clone, Copy, Debug, EnumString, PartialEq)]
#[strum(ascii_case_insensitive)]
pub enum Direction {
    /// Process in ascending key order.
    Ascending,
    /// Process in descending key order.
    Descending,
}

/// Store specific errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A key of the wrong width was supplied.
    #[error("key is {0} bytes, this container uses {1} byte keys")]
    BadKeySize(usize, usize),

    /// The key (or any record at all) was absent.
    #[error("key not found")]
    NotFound,

    /// Rejected creation parameters.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The pool would outgrow 32-bit block pointers.
    #[error("block pool has exhausted the 32-bit pointer space")]
    CapacityExhausted,
}

/// An ordered key/value store held in a single BTreeDB5 container file.
///
/// Keys are fixed-width byte strings, values arbitrary byte payloads.
/// Mutations accumulate in a transaction that becomes durable on
/// [`commit`](Self::commit) and is discarded by [`rollback`](Self::rollback)
/// (or by dropping the store without committing).
pub struct BTreeDb {
    path: PathBuf,
    inner: RwLock<Inner>,
    alloc: Mutex<FreeList>,
}

/// Engine state guarded by the outer reader/writer lock.
pub(crate) struct Inner {
    file: BlockFile,
    geom: Geometry,
    identifier: String,
    root: u32,
    root_is_leaf: bool,
}

impl BTreeDb {
    /// Create a new container at `path`, truncating anything already there.
    ///
    /// `identifier` is a free-form label of at most 16 bytes stored in the
    /// header. `block_size` and `key_size` are fixed for the life of the
    /// container.
    pub async fn try_create<P: AsRef<Path>>(
        origin: P,
        identifier: &str,
        block_size: usize,
        key_size: usize,
    ) -> Result<Self> {
        let path: &Path = origin.as_ref();

        if key_size == 0 {
            return Err(StoreError::InvalidArgument("key size must be non-zero".into()).into());
        }
        if block_size < 64 || block_size < 11 + 3 * (key_size + 4) {
            return Err(StoreError::InvalidArgument(format!(
                "block size {block_size} is too small for {key_size} byte keys"
            ))
            .into());
        }

        tracing::info!(
            path = %path.display(),
            identifier,
            block_size,
            key_size,
            "creating container"
        );

        let mut header = Header::new(identifier, block_size, key_size)?;

        let mut file = BlockFile::create(path, HEADER_SIZE)?;
        file.set_block_size(block_size)?;
        file.grow(1)?;

        let geom = Geometry {
            block_size,
            key_size,
        };

        // Block 0 is an empty leaf; both descriptors start out pointing at
        // it, so either root reopens to the same empty container.
        write_leaf_chain(&mut file, geom, &[0], &encode_records(geom, &[]))?;
        let descriptor = RootDescriptor {
            free_head: NIL,
            device_size: (HEADER_SIZE + block_size) as i64,
            root: 0,
            root_is_leaf: true,
        };
        header.roots = [descriptor, descriptor];
        header.write(file.header_mut());
        file.flush()?;

        Ok(Self {
            path: path.into(),
            inner: RwLock::new(Inner {
                file,
                geom,
                identifier: identifier.to_string(),
                root: 0,
                root_is_leaf: true,
            }),
            alloc: Mutex::new(FreeList::new(NIL)),
        })
    }

    /// Open an existing container at `path`.
    pub async fn try_open<P: AsRef<Path>>(origin: P) -> Result<Self> {
        let path: &Path = origin.as_ref();

        tracing::info!(path = %path.display(), "opening container");

        let mut file = BlockFile::open(path, HEADER_SIZE)?;
        let header = Header::read(file.header())?;
        file.set_block_size(header.block_size)?;

        let live = header.roots[header.live()];

        Ok(Self {
            path: path.into(),
            inner: RwLock::new(Inner {
                file,
                geom: Geometry {
                    block_size: header.block_size,
                    key_size: header.key_size,
                },
                identifier: header.identifier,
                root: live.root,
                root_is_leaf: live.root_is_leaf,
            }),
            alloc: Mutex::new(FreeList::new(live.free_head)),
        })
    }

    /// Commit outstanding changes, then release the container.
    ///
    /// Dropping the store without calling this discards everything since
    /// the last commit, exactly as a crash would.
    pub async fn close(self) -> Result<()> {
        self.commit().await
    }

    /// Key width this container was created with.
    pub async fn key_size(&self) -> usize {
        self.inner.read().await.geom.key_size
    }

    /// Block size this container was created with.
    pub async fn block_size(&self) -> usize {
        self.inner.read().await.geom.block_size
    }

    /// The identifier string stored in the header.
    pub async fn identifier(&self) -> String {
        self.inner.read().await.identifier.clone()
    }

    /// Get the value stored under `key`.
    pub async fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let inner = self.inner.read().await;
        inner.check_key(key)?;
        inner.lookup(key)
    }

    /// Does the container hold this key?
    pub async fn contains(&self, key: &[u8]) -> Result<bool> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// The record with the smallest key.
    pub async fn first(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let inner = self.inner.read().await;
        inner.edge_record(false)
    }

    /// The record with the largest key.
    pub async fn last(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let inner = self.inner.read().await;
        inner.edge_record(true)
    }

    /// Insert a key and value, returning the previous value if the key was
    /// already present.
    pub async fn insert(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.write().await;
        let mut alloc = self.alloc.lock().await;
        inner.check_key(key)?;
        tracing::debug!(key = ?key, len = value.len(), "insert");
        inner.insert_record(&mut alloc, key, value)
    }

    /// Delete a key, returning its value. Deleting an absent key is a
    /// successful no-op returning `None`.
    pub async fn delete(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.write().await;
        let mut alloc = self.alloc.lock().await;
        inner.check_key(key)?;
        tracing::debug!(key = ?key, "delete");
        inner.delete_record(&mut alloc, key)
    }

    /// Visit every record in ascending key order.
    pub async fn ascend(&self, mut f: impl FnMut(&[u8], &[u8])) -> Result<()> {
        let inner = self.inner.read().await;
        inner.walk(inner.root, inner.root_is_leaf, None, None, false, &mut f)
    }

    /// Visit every record in descending key order.
    pub async fn descend(&self, mut f: impl FnMut(&[u8], &[u8])) -> Result<()> {
        let inner = self.inner.read().await;
        inner.walk(inner.root, inner.root_is_leaf, None, None, true, &mut f)
    }

    /// Visit records with `start <= key < stop` in ascending order. Either
    /// bound may be `None` for unbounded.
    pub async fn ascend_range(
        &self,
        start: Option<&[u8]>,
        stop: Option<&[u8]>,
        mut f: impl FnMut(&[u8], &[u8]),
    ) -> Result<()> {
        let inner = self.inner.read().await;
        inner.check_bounds(start, stop)?;
        inner.walk(inner.root, inner.root_is_leaf, start, stop, false, &mut f)
    }

    /// Visit records with `stop < key <= start` in descending order.
    /// Either bound may be `None` for unbounded.
    pub async fn descend_range(
        &self,
        start: Option<&[u8]>,
        stop: Option<&[u8]>,
        mut f: impl FnMut(&[u8], &[u8]),
    ) -> Result<()> {
        let inner = self.inner.read().await;
        inner.check_bounds(start, stop)?;
        inner.walk(inner.root, inner.root_is_leaf, start, stop, true, &mut f)
    }

    /// Make the working tree durable: fold freed blocks back into the
    /// free-list, write the inactive root descriptor and flip the
    /// active-root bit. Until this returns, readers in other handles and a
    /// reopened file keep seeing the previous commit.
    pub async fn commit(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        let mut alloc = self.alloc.lock().await;
        tracing::info!(path = %self.path.display(), "commit");
        inner.commit(&mut alloc)
    }

    /// Discard everything since the last commit and shrink the file back
    /// to its committed capacity.
    pub async fn rollback(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        let mut alloc = self.alloc.lock().await;
        tracing::info!(path = %self.path.display(), "rollback");
        inner.rollback(&mut alloc)
    }

    /// Flush the mapping to disk without committing.
    pub async fn flush(&self) -> Result<()> {
        self.inner.read().await.file.flush()
    }

    /// Return count of records.
    pub async fn count(&self) -> Result<usize> {
        let inner = self.inner.read().await;
        let mut count = 0;
        inner.visit_leaves(inner.root, inner.root_is_leaf, &mut |leaf| {
            count += leaf.records.len();
        })?;
        Ok(count)
    }

    /// Reset the container to the freshly created state.
    pub async fn clear(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        let mut alloc = self.alloc.lock().await;
        let geom = inner.geom;
        inner.file.resize(1)?;
        write_leaf_chain(&mut inner.file, geom, &[0], &encode_records(geom, &[]))?;

        let mut header = Header::new(&inner.identifier, geom.block_size, geom.key_size)?;
        let descriptor = RootDescriptor {
            free_head: NIL,
            device_size: (HEADER_SIZE + geom.block_size) as i64,
            root: 0,
            root_is_leaf: true,
        };
        header.roots = [descriptor, descriptor];
        header.write(inner.file.header_mut());

        alloc.clear();
        alloc.set_head(NIL);
        inner.root = 0;
        inner.root_is_leaf = true;
        inner.file.flush()
    }

    /// Leaf space utilization: serialized record bytes over the leaf block
    /// bytes holding them.
    pub async fn utilization(&self) -> Result<f64> {
        let inner = self.inner.read().await;
        let mut used = 0usize;
        let mut held = 0usize;
        inner.visit_leaves(inner.root, inner.root_is_leaf, &mut |leaf| {
            used += LeafNode::size_of(inner.geom, &leaf.records);
            held += leaf.chain.len() * inner.geom.leaf_body();
        })?;
        if held == 0 {
            return Ok(0.0);
        }
        Ok(used as f64 / held as f64)
    }

    /// Log basic information about the container.
    pub async fn info(&self) -> Result<()> {
        let count = self.count().await?;
        let inner = self.inner.read().await;
        tracing::info!(
            path = %self.path.display(),
            identifier = %inner.identifier,
            block_size = inner.geom.block_size,
            key_size = inner.geom.key_size,
            blocks = inner.file.capacity(),
            records = count,
            "container"
        );
        Ok(())
    }

    /// Check the structural invariants of the whole container: key
    /// ordering, separator placement, child-count bounds, duplicated tags
    /// and the partition of the block pool between the tree, the
    /// free-list and the in-memory allocator state.
    pub async fn verify(&self) -> Result<()> {
        let inner = self.inner.read().await;
        let alloc = self.alloc.lock().await;

        let mut reachable = HashSet::new();
        inner.verify_subtree(
            inner.root,
            inner.root_is_leaf,
            None,
            true,
            &mut reachable,
        )?;

        // Walk the free-list chain.
        let mut free = HashSet::new();
        let mut head = alloc.head();
        while head != NIL {
            ensure!(free.insert(head), "free chain revisits block {head}");
            let (next, ptrs) = read_free(&inner.file, inner.geom, head)?;
            for ptr in ptrs {
                ensure!(free.insert(ptr), "block {ptr} reclaimed twice");
            }
            head = next;
        }

        let (_, available, pending) = alloc.uncommitted();
        for block in 0..inner.file.capacity() as u32 {
            let places = reachable.contains(&block) as usize
                + free.contains(&block) as usize
                + available.contains(&block) as usize
                + pending.contains(&block) as usize;
            ensure!(
                places == 1,
                "block {block} is claimed by {places} owners, expected exactly one"
            );
        }
        Ok(())
    }

    /// Traverse entries until the stream is exhausted or the callback
    /// returns break.
    pub async fn traverse_entries(
        &self,
        direction: Direction,
        mut f: impl FnMut((Vec<u8>, Vec<u8>)) -> ControlFlow<()>,
    ) {
        let mut streamer = self.entries(direction).await;
        while let Some(entry) = streamer.next().await {
            match f(entry) {
                ControlFlow::Break(_) => break,
                ControlFlow::Continue(_) => continue,
            }
        }
    }

    /// Traverse keys until the stream is exhausted or the callback
    /// returns break.
    pub async fn traverse_keys(
        &self,
        direction: Direction,
        mut f: impl FnMut(Vec<u8>) -> ControlFlow<()>,
    ) {
        let mut streamer = self.keys(direction).await;
        while let Some(key) = streamer.next().await {
            match f(key) {
                ControlFlow::Break(_) => break,
                ControlFlow::Continue(_) => continue,
            }
        }
    }

    /// Traverse values until the stream is exhausted or the callback
    /// returns break.
    pub async fn traverse_values(
        &self,
        direction: Direction,
        mut f: impl FnMut(Vec<u8>) -> ControlFlow<()>,
    ) {
        let mut streamer = self.values(direction).await;
        while let Some(value) = streamer.next().await {
            match f(value) {
                ControlFlow::Break(_) => break,
                ControlFlow::Continue(_) => continue,
            }
        }
    }

    /// Print to stdout all the keys and values in the container, keys in
    /// hex and values lossily decoded.
    pub async fn print_entries(&self, direction: Direction) {
        let mut sep = "";
        let callback = |(key, value): (Vec<u8>, Vec<u8>)| {
            print!(
                "{sep}{}:{}",
                hex::encode(&key),
                String::from_utf8_lossy(&value)
            );
            sep = ", ";
            ControlFlow::Continue(())
        };
        self.traverse_entries(direction, callback).await;
        println!();
    }

    /// Print to stdout all the keys in the container, in hex.
    pub async fn print_keys(&self, direction: Direction) {
        let mut sep = "";
        let callback = |key: Vec<u8>| {
            print!("{sep}{}", hex::encode(&key));
            sep = ", ";
            ControlFlow::Continue(())
        };
        self.traverse_keys(direction, callback).await;
        println!();
    }

    /// Print to stdout all the values in the container, lossily decoded.
    pub async fn print_values(&self, direction: Direction) {
        let mut sep = "";
        let callback = |value: Vec<u8>| {
            print!("{sep}{}", String::from_utf8_lossy(&value));
            sep = ", ";
            ControlFlow::Continue(())
        };
        self.traverse_values(direction, callback).await;
        println!();
    }

    pub(crate) async fn read_inner(&self) -> tokio::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().await
    }
}

fn is_not_found(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<StoreError>(), Some(StoreError::NotFound))
}

impl Inner {
    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.geom.key_size {
            return Err(StoreError::BadKeySize(key.len(), self.geom.key_size).into());
        }
        Ok(())
    }

    fn check_bounds(&self, start: Option<&[u8]>, stop: Option<&[u8]>) -> Result<()> {
        for bound in [start, stop].into_iter().flatten() {
            self.check_key(bound)?;
        }
        Ok(())
    }

    fn read_index(&self, ptr: u32) -> Result<IndexNode> {
        IndexNode::read(&self.file, self.geom, ptr)
    }

    fn read_leaf(&self, ptr: u32) -> Result<LeafNode> {
        LeafNode::read(&self.file, self.geom, ptr)
    }

    /// Walk from the root to the leaf that owns `key`, collecting the
    /// index nodes and chosen child slots along the way.
    fn descend_to_leaf(&self, key: &[u8]) -> Result<(Vec<(IndexNode, usize)>, LeafNode)> {
        let mut path = Vec::new();
        if self.root_is_leaf {
            return Ok((path, self.read_leaf(self.root)?));
        }
        let mut node = self.read_index(self.root)?;
        loop {
            let slot = node.child_slot(key);
            let child = node.children[slot];
            let height = node.height;
            path.push((node, slot));
            if height == 0 {
                return Ok((path, self.read_leaf(child)?));
            }
            node = self.read_index(child)?;
            if node.height != height - 1 {
                return Err(CodecError::BadHeight(child, node.height, height - 1).into());
            }
        }
    }

    fn lookup(&self, key: &[u8]) -> Result<Vec<u8>> {
        let (_, leaf) = self.descend_to_leaf(key)?;
        match LeafNode::slot(&leaf.records, key) {
            Ok(at) => Ok(leaf.records[at].value.clone()),
            Err(_) => Err(StoreError::NotFound.into()),
        }
    }

    fn edge_record(&self, last: bool) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut ptr = self.root;
        if !self.root_is_leaf {
            let mut node = self.read_index(ptr)?;
            loop {
                ptr = if last {
                    *node.children.last().unwrap()
                } else {
                    node.children[0]
                };
                if node.height == 0 {
                    break;
                }
                node = self.read_index(ptr)?;
            }
        }
        let leaf = self.read_leaf(ptr)?;
        let record = if last {
            leaf.records.last()
        } else {
            leaf.records.first()
        };
        match record {
            Some(r) => Ok((r.key.clone(), r.value.clone())),
            None => Err(StoreError::NotFound.into()),
        }
    }

    /// Copy-on-write an index node: the old block goes to the allocator,
    /// the node lands in a fresh block whose pointer it takes.
    fn write_index_cow(&mut self, alloc: &mut FreeList, node: &mut IndexNode) -> Result<u32> {
        alloc.push(node.ptr);
        self.write_index_new(alloc, node)
    }

    fn write_index_new(&mut self, alloc: &mut FreeList, node: &mut IndexNode) -> Result<u32> {
        let ptr = alloc.pop(&mut self.file, self.geom)?;
        node.ptr = ptr;
        node.write(&mut self.file, self.geom, ptr)?;
        Ok(ptr)
    }

    /// Copy-on-write a logical leaf: every block of the old chain goes to
    /// the allocator, the records land in a freshly allocated chain.
    fn write_leaf_cow(
        &mut self,
        alloc: &mut FreeList,
        old_chain: &[u32],
        records: &[Record],
    ) -> Result<u32> {
        for ptr in old_chain {
            alloc.push(*ptr);
        }
        let body = encode_records(self.geom, records);
        let blocks = leaf_blocks_needed(self.geom, body.len());
        let mut ptrs = Vec::with_capacity(blocks);
        for _ in 0..blocks {
            ptrs.push(alloc.pop(&mut self.file, self.geom)?);
        }
        write_leaf_chain(&mut self.file, self.geom, &ptrs, &body)?;
        Ok(ptrs[0])
    }

    /// Rewrite the spine above a changed child, bottom-up, and point the
    /// working root at the result.
    fn rewrite_spine(
        &mut self,
        alloc: &mut FreeList,
        mut path: Vec<(IndexNode, usize)>,
        mut child: u32,
    ) -> Result<()> {
        while let Some((mut node, slot)) = path.pop() {
            node.children[slot] = child;
            child = self.write_index_cow(alloc, &mut node)?;
        }
        self.root = child;
        Ok(())
    }

    fn insert_record(
        &mut self,
        alloc: &mut FreeList,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let (path, leaf) = self.descend_to_leaf(key)?;
        let mut records = leaf.records;
        let previous = match LeafNode::slot(&records, key) {
            Ok(at) => Some(std::mem::replace(&mut records[at].value, value.to_vec())),
            Err(at) => {
                records.insert(
                    at,
                    Record {
                        key: key.to_vec(),
                        value: value.to_vec(),
                    },
                );
                None
            }
        };

        // A leaf may spill into a chain of up to two blocks before it
        // splits; a single oversized record chains indefinitely instead.
        let size = LeafNode::size_of(self.geom, &records);
        if records.len() == 1 || size < 2 * self.geom.leaf_body() {
            let head = self.write_leaf_cow(alloc, &leaf.chain, &records)?;
            self.rewrite_spine(alloc, path, head)?;
        } else {
            let right = records.split_off(records.len() / 2);
            let separator = right[0].key.clone();
            for ptr in &leaf.chain {
                alloc.push(*ptr);
            }
            let left_head = self.write_leaf_cow(alloc, &[], &records)?;
            let right_head = self.write_leaf_cow(alloc, &[], &right)?;
            self.insert_into_parent(alloc, path, separator, left_head, right_head, 0)?;
        }
        Ok(previous)
    }

    /// Record a child split in the parent, splitting upward as needed.
    /// `height` is the height a newly created root would get.
    fn insert_into_parent(
        &mut self,
        alloc: &mut FreeList,
        mut path: Vec<(IndexNode, usize)>,
        separator: Vec<u8>,
        left: u32,
        right: u32,
        height: u8,
    ) -> Result<()> {
        let Some((mut node, slot)) = path.pop() else {
            let mut root = IndexNode {
                ptr: NIL,
                height,
                keys: vec![separator],
                children: vec![left, right],
            };
            let ptr = self.write_index_new(alloc, &mut root)?;
            self.root = ptr;
            self.root_is_leaf = false;
            return Ok(());
        };

        node.children[slot] = left;
        node.keys.insert(slot, separator);
        node.children.insert(slot + 1, right);

        if node.children.len() <= self.geom.inter_max() {
            let ptr = self.write_index_cow(alloc, &mut node)?;
            return self.rewrite_spine(alloc, path, ptr);
        }

        // Split at the middle key, which moves up a level.
        let mid = node.keys.len() / 2;
        let promoted = node.keys[mid].clone();
        let right_keys = node.keys.split_off(mid + 1);
        node.keys.pop();
        let right_children = node.children.split_off(mid + 1);
        let mut sibling = IndexNode {
            ptr: NIL,
            height: node.height,
            keys: right_keys,
            children: right_children,
        };
        let next_height = node.height + 1;
        let left_ptr = self.write_index_cow(alloc, &mut node)?;
        let right_ptr = self.write_index_new(alloc, &mut sibling)?;
        self.insert_into_parent(alloc, path, promoted, left_ptr, right_ptr, next_height)
    }

    fn delete_record(&mut self, alloc: &mut FreeList, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (mut path, leaf) = self.descend_to_leaf(key)?;
        let mut records = leaf.records;
        let at = match LeafNode::slot(&records, key) {
            Ok(at) => at,
            Err(_) => return Ok(None),
        };
        let removed = records.remove(at);

        if path.is_empty() {
            // The root leaf may underfill freely, down to empty.
            let head = self.write_leaf_cow(alloc, &leaf.chain, &records)?;
            self.root = head;
            return Ok(Some(removed.value));
        }

        if LeafNode::size_of(self.geom, &records) >= self.geom.leaf_body() {
            let head = self.write_leaf_cow(alloc, &leaf.chain, &records)?;
            self.rewrite_spine(alloc, path, head)?;
            return Ok(Some(removed.value));
        }

        let (parent, slot) = path.pop().unwrap();
        self.rebalance_leaf(alloc, path, parent, slot, &leaf.chain, records)?;
        Ok(Some(removed.value))
    }

    /// An underfull leaf borrows from or merges with a sibling, preferring
    /// the one on its left.
    fn rebalance_leaf(
        &mut self,
        alloc: &mut FreeList,
        path: Vec<(IndexNode, usize)>,
        mut parent: IndexNode,
        slot: usize,
        chain: &[u32],
        mut records: Vec<Record>,
    ) -> Result<()> {
        let (sibling_slot, left) = if slot > 0 {
            (slot - 1, true)
        } else if slot + 1 < parent.children.len() {
            (slot + 1, false)
        } else {
            // No sibling to draw on; tolerate the underfull leaf.
            let head = self.write_leaf_cow(alloc, chain, &records)?;
            parent.children[slot] = head;
            let ptr = self.write_index_cow(alloc, &mut parent)?;
            return self.rewrite_spine(alloc, path, ptr);
        };

        let sibling = self.read_leaf(parent.children[sibling_slot])?;
        let mut sibling_records = sibling.records;

        let can_donate = sibling_records.len() > 1
            && LeafNode::size_of(self.geom, &sibling_records) > self.geom.leaf_body();
        if can_donate {
            // Borrow one record and refresh the separating key.
            if left {
                let donated = sibling_records.pop().unwrap();
                records.insert(0, donated);
                parent.keys[slot - 1] = records[0].key.clone();
            } else {
                let donated = sibling_records.remove(0);
                records.push(donated);
                parent.keys[slot] = sibling_records[0].key.clone();
            }
            let child_head = self.write_leaf_cow(alloc, chain, &records)?;
            let sibling_head = self.write_leaf_cow(alloc, &sibling.chain, &sibling_records)?;
            parent.children[slot] = child_head;
            parent.children[sibling_slot] = sibling_head;
            let ptr = self.write_index_cow(alloc, &mut parent)?;
            return self.rewrite_spine(alloc, path, ptr);
        }

        // Merge the two leaves; the parent loses a key and a child.
        for ptr in chain.iter().chain(sibling.chain.iter()) {
            alloc.push(*ptr);
        }
        let merged = if left {
            parent.keys.remove(slot - 1);
            parent.children.remove(slot);
            sibling_records.extend(records);
            sibling_records
        } else {
            parent.keys.remove(slot);
            parent.children.remove(slot + 1);
            records.extend(sibling_records);
            records
        };
        let head = self.write_leaf_cow(alloc, &[], &merged)?;
        let merged_slot = if left { slot - 1 } else { slot };
        parent.children[merged_slot] = head;

        self.rebalance_index(alloc, path, parent)
    }

    /// Rewrite an index node after it lost a child, borrowing from or
    /// merging with siblings up the spine while nodes underflow.
    fn rebalance_index(
        &mut self,
        alloc: &mut FreeList,
        mut path: Vec<(IndexNode, usize)>,
        mut node: IndexNode,
    ) -> Result<()> {
        loop {
            let Some((mut parent, slot)) = path.pop() else {
                // `node` is the root.
                if node.children.len() == 1 {
                    alloc.push(node.ptr);
                    self.root = node.children[0];
                    self.root_is_leaf = node.height == 0;
                    return Ok(());
                }
                let ptr = self.write_index_cow(alloc, &mut node)?;
                self.root = ptr;
                return Ok(());
            };

            if node.children.len() >= self.geom.index_min() {
                let ptr = self.write_index_cow(alloc, &mut node)?;
                parent.children[slot] = ptr;
                let ptr = self.write_index_cow(alloc, &mut parent)?;
                return self.rewrite_spine(alloc, path, ptr);
            }

            let (sibling_slot, left) = if slot > 0 {
                (slot - 1, true)
            } else if slot + 1 < parent.children.len() {
                (slot + 1, false)
            } else {
                let ptr = self.write_index_cow(alloc, &mut node)?;
                parent.children[slot] = ptr;
                let ptr = self.write_index_cow(alloc, &mut parent)?;
                return self.rewrite_spine(alloc, path, ptr);
            };

            let mut sibling = self.read_index(parent.children[sibling_slot])?;

            if sibling.children.len() > self.geom.index_min() {
                // Rotate one child through the parent separator.
                if left {
                    node.keys.insert(0, parent.keys[slot - 1].clone());
                    node.children.insert(0, sibling.children.pop().unwrap());
                    parent.keys[slot - 1] = sibling.keys.pop().unwrap();
                } else {
                    node.keys.push(parent.keys[slot].clone());
                    node.children.push(sibling.children.remove(0));
                    parent.keys[slot] = sibling.keys.remove(0);
                }
                let node_ptr = self.write_index_cow(alloc, &mut node)?;
                let sibling_ptr = self.write_index_cow(alloc, &mut sibling)?;
                parent.children[slot] = node_ptr;
                parent.children[sibling_slot] = sibling_ptr;
                let ptr = self.write_index_cow(alloc, &mut parent)?;
                return self.rewrite_spine(alloc, path, ptr);
            }

            // Merge, demoting the parent separator between the two nodes.
            alloc.push(sibling.ptr);
            if left {
                let separator = parent.keys.remove(slot - 1);
                parent.children.remove(slot);
                let mut keys = sibling.keys;
                keys.push(separator);
                keys.extend(node.keys);
                node.keys = keys;
                let mut children = sibling.children;
                children.extend(node.children);
                node.children = children;
            } else {
                let separator = parent.keys.remove(slot);
                parent.children.remove(slot + 1);
                node.keys.push(separator);
                node.keys.extend(sibling.keys);
                node.children.extend(sibling.children);
            }
            let ptr = self.write_index_cow(alloc, &mut node)?;
            let merged_slot = if left { slot - 1 } else { slot };
            parent.children[merged_slot] = ptr;

            node = parent;
        }
    }

    /// In-order traversal over `[start, stop)` ascending or
    /// `(stop, start]` descending, pruned to the subtrees that can hold
    /// the range.
    fn walk(
        &self,
        ptr: u32,
        leaf: bool,
        start: Option<&[u8]>,
        stop: Option<&[u8]>,
        descending: bool,
        f: &mut dyn FnMut(&[u8], &[u8]),
    ) -> Result<()> {
        if leaf {
            let node = self.read_leaf(ptr)?;
            let in_range = |key: &[u8]| {
                if descending {
                    start.map_or(true, |upper| key <= upper)
                        && stop.map_or(true, |lower| key > lower)
                } else {
                    start.map_or(true, |lower| key >= lower)
                        && stop.map_or(true, |upper| key < upper)
                }
            };
            if descending {
                for record in node.records.iter().rev() {
                    if in_range(&record.key) {
                        f(&record.key, &record.value);
                    }
                }
            } else {
                for record in &node.records {
                    if in_range(&record.key) {
                        f(&record.key, &record.value);
                    }
                }
            }
            return Ok(());
        }

        let node = self.read_index(ptr)?;
        let (lower, upper) = if descending {
            (stop, start)
        } else {
            (start, stop)
        };
        let first = lower.map_or(0, |key| node.child_slot(key));
        let last = upper.map_or(node.children.len() - 1, |key| node.child_slot(key));
        let child_is_leaf = node.height == 0;
        if descending {
            for slot in (first..=last).rev() {
                self.walk(node.children[slot], child_is_leaf, start, stop, true, f)?;
            }
        } else {
            for slot in first..=last {
                self.walk(node.children[slot], child_is_leaf, start, stop, false, f)?;
            }
        }
        Ok(())
    }

    fn visit_leaves(
        &self,
        ptr: u32,
        leaf: bool,
        f: &mut dyn FnMut(&LeafNode),
    ) -> Result<()> {
        if leaf {
            f(&self.read_leaf(ptr)?);
            return Ok(());
        }
        let node = self.read_index(ptr)?;
        for child in &node.children {
            self.visit_leaves(*child, node.height == 0, f)?;
        }
        Ok(())
    }

    /// Records at or after `key` (strictly after unless `inclusive`),
    /// taken from the leaf that owns the key or, when that is exhausted,
    /// the next leaf to the right.
    pub(crate) fn leaf_records_from(&self, key: &[u8], inclusive: bool) -> Result<Vec<Record>> {
        let (path, leaf) = self.descend_to_leaf(key)?;
        let records: Vec<Record> = leaf
            .records
            .into_iter()
            .filter(|r| {
                if inclusive {
                    r.key.as_slice() >= key
                } else {
                    r.key.as_slice() > key
                }
            })
            .collect();
        if !records.is_empty() {
            return Ok(records);
        }
        for (node, slot) in path.iter().rev() {
            if slot + 1 < node.children.len() {
                return self.edge_leaf_records(node.children[slot + 1], node.height == 0, false);
            }
        }
        Ok(Vec::new())
    }

    /// The descending counterpart of [`Self::leaf_records_from`].
    pub(crate) fn leaf_records_until(&self, key: &[u8], inclusive: bool) -> Result<Vec<Record>> {
        let (path, leaf) = self.descend_to_leaf(key)?;
        let records: Vec<Record> = leaf
            .records
            .into_iter()
            .filter(|r| {
                if inclusive {
                    r.key.as_slice() <= key
                } else {
                    r.key.as_slice() < key
                }
            })
            .collect();
        if !records.is_empty() {
            return Ok(records);
        }
        for (node, slot) in path.iter().rev() {
            if *slot > 0 {
                return self.edge_leaf_records(node.children[slot - 1], node.height == 0, true);
            }
        }
        Ok(Vec::new())
    }

    /// Records of the leftmost (or rightmost) leaf under `ptr`.
    pub(crate) fn edge_leaf_records(
        &self,
        ptr: u32,
        leaf: bool,
        rightmost: bool,
    ) -> Result<Vec<Record>> {
        let mut ptr = ptr;
        let mut leaf = leaf;
        while !leaf {
            let node = self.read_index(ptr)?;
            ptr = if rightmost {
                *node.children.last().unwrap()
            } else {
                node.children[0]
            };
            leaf = node.height == 0;
        }
        Ok(self.read_leaf(ptr)?.records)
    }

    pub(crate) fn first_leaf_records(&self) -> Result<Vec<Record>> {
        self.edge_leaf_records(self.root, self.root_is_leaf, false)
    }

    pub(crate) fn last_leaf_records(&self) -> Result<Vec<Record>> {
        self.edge_leaf_records(self.root, self.root_is_leaf, true)
    }

    fn commit(&mut self, alloc: &mut FreeList) -> Result<()> {
        let mut header = Header::read(self.file.header())?;

        // Stage the working tree in the inactive descriptor slot.
        header.roots[header.inactive()] = RootDescriptor {
            free_head: alloc.head(),
            device_size: (HEADER_SIZE + self.geom.block_size * self.file.capacity()) as i64,
            root: self.root,
            root_is_leaf: self.root_is_leaf,
        };
        header.write(self.file.header_mut());

        // The flip is the commit point: from here the staged descriptor is
        // the live one.
        header.use_alt_root = !header.use_alt_root;
        header.write(self.file.header_mut());

        // Blocks of the superseded snapshot are fair game now; fold them
        // into the chain and persist the resulting head.
        alloc.fold(&mut self.file, self.geom)?;
        let live = header.live();
        header.roots[live].free_head = alloc.head();
        header.write(self.file.header_mut());

        self.file.flush()
    }

    fn rollback(&mut self, alloc: &mut FreeList) -> Result<()> {
        let header = Header::read(self.file.header())?;
        let live = header.roots[header.live()];

        self.root = live.root;
        self.root_is_leaf = live.root_is_leaf;
        alloc.clear();
        alloc.set_head(live.free_head);

        let device = live.device_size as usize;
        if device > HEADER_SIZE {
            let blocks = (device - HEADER_SIZE) / self.geom.block_size;
            if blocks < self.file.capacity() {
                self.file.resize(blocks)?;
            }
        }
        Ok(())
    }

    /// Child-count bounds, key ordering and separator placement for the
    /// subtree under `ptr`; fills `reachable` with every visited block.
    fn verify_subtree(
        &self,
        ptr: u32,
        leaf: bool,
        expected_height: Option<u8>,
        is_root: bool,
        reachable: &mut HashSet<u32>,
    ) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>)> {
        if leaf {
            let node = self.read_leaf(ptr)?;
            for block in &node.chain {
                ensure!(
                    reachable.insert(*block),
                    "leaf block {block} is reachable twice"
                );
            }
            for pair in node.records.windows(2) {
                ensure!(
                    pair[0].key < pair[1].key,
                    "leaf {ptr} keys are not strictly increasing"
                );
            }
            return Ok((
                node.records.first().map(|r| r.key.clone()),
                node.records.last().map(|r| r.key.clone()),
            ));
        }

        let node = self.read_index(ptr)?;
        ensure!(
            reachable.insert(ptr),
            "index block {ptr} is reachable twice"
        );
        if let Some(height) = expected_height {
            ensure!(
                node.height == height,
                "index block {ptr} has height {} where {height} was expected",
                node.height
            );
        }
        ensure!(
            node.children.len() <= self.geom.inter_max(),
            "index block {ptr} has {} children, over the fan-out bound",
            node.children.len()
        );
        let minimum = if is_root { 2 } else { self.geom.index_min() };
        ensure!(
            node.children.len() >= minimum,
            "index block {ptr} has {} children, under the minimum of {minimum}",
            node.children.len()
        );
        for pair in node.keys.windows(2) {
            ensure!(
                pair[0] < pair[1],
                "index {ptr} separators are not strictly increasing"
            );
        }

        let child_is_leaf = node.height == 0;
        let child_height = (!child_is_leaf).then(|| node.height - 1);
        let mut subtree_min = None;
        let mut previous_max: Option<Vec<u8>> = None;
        for (slot, child) in node.children.iter().enumerate() {
            let (low, high) =
                self.verify_subtree(*child, child_is_leaf, child_height, false, reachable)?;
            if slot == 0 {
                subtree_min = low.clone();
            }
            if slot > 0 {
                let separator = &node.keys[slot - 1];
                if let Some(previous) = &previous_max {
                    ensure!(
                        previous < separator,
                        "separator {slot} of index {ptr} does not bound its left subtree"
                    );
                }
                if let Some(low) = &low {
                    ensure!(
                        low.as_slice() >= separator.as_slice(),
                        "separator {slot} of index {ptr} does not bound its right subtree"
                    );
                }
            }
            if high.is_some() {
                previous_max = high;
            }
        }
        let subtree_max = previous_max;
        if subtree_min.is_none() && subtree_max.is_none() {
            bail!("index block {ptr} has no records beneath it");
        }
        Ok((subtree_min, subtree_max))
    }
}

#[cfg(test)]
mod tests;
