//! The B-tree index: one resident node cache entry per chunk chain, one
//! tree per path depth. An entry's `children` field is the root chunk UID
//! of the next-deeper level's tree (or [`INVALID_CHUNK_UID`] if the path
//! under this segment has never been populated); an entry's position
//! within its own node is ordered by `links`, the usual multiway B-tree
//! child pointers. Every tree's root — the pinned top-level root at
//! [`crate::storage::StorageFile::root_uid`] and every nested root reached
//! through a `children` pointer alike — keeps its chunk UID for its whole
//! life: overflow grows the root in place (demoting its old content into
//! two fresh children) and underflow shrinks it in place (promoting an
//! only child's content back up), so no split or merge ever requires a
//! parent to learn a new address for a subtree root it already points to.

pub mod lock;

use std::io::Read;
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::cache::BTreeCache;
use crate::error::{Error, Result};
use crate::hash::{digest_segment, Digest};
use crate::key::Key;
use crate::storage::{ChunkUid, StorageFile, Transaction, INVALID_CHUNK_UID};
use crate::value::{self, PackedValue, Value};
use lock::Locked;

/// `PackedValue::type_index` used for an entry that exists only to carry a
/// `children` subtree — e.g. `/a/b` was inserted while `/a` itself never
/// received a value of its own.
const NO_VALUE_TYPE: u64 = 8;

/// One resident (or about-to-be-written) B-tree node.
///
/// Parallel arrays: `digests[i]`, `values[i]`, `expirations[i]`, and
/// `children[i]` together describe the entry at position `i`. `links` has
/// one more element than the others — `links[i]` is the subtree holding
/// everything less than `digests[i]`, and `links[n]` holds everything
/// greater than `digests[n-1]`. A leaf node is exactly one whose links are
/// all [`INVALID_CHUNK_UID`].
#[derive(Debug, Clone)]
pub struct NodeData {
    pub uid: ChunkUid,
    pub digests: Vec<Digest>,
    pub values: Vec<PackedValue>,
    pub expirations: Vec<u64>,
    pub children: Vec<ChunkUid>,
    pub links: Vec<ChunkUid>,
    pub on_disk: bool,
    pub changed: bool,
}

fn is_leaf(node: &NodeData) -> bool {
    node.links.iter().all(|&l| l == INVALID_CHUNK_UID)
}

fn is_expired(expiration: u64) -> bool {
    if expiration == 0 {
        return false;
    }
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    expiration <= now
}

fn serialize(node: &NodeData) -> Vec<u8> {
    let n = node.digests.len();
    let mut buf = Vec::with_capacity(8 + n * (8 + 16 + 8 + 8) + (n + 1) * 8);
    buf.write_u64::<BigEndian>(n as u64).unwrap();
    for d in &node.digests {
        buf.write_u64::<BigEndian>(*d).unwrap();
    }
    for v in &node.values {
        v.write(&mut buf).unwrap();
    }
    for e in &node.expirations {
        buf.write_u64::<BigEndian>(*e).unwrap();
    }
    for c in &node.children {
        buf.write_i64::<BigEndian>(*c).unwrap();
    }
    for l in &node.links {
        buf.write_i64::<BigEndian>(*l).unwrap();
    }
    buf
}

fn deserialize<R: Read>(uid: ChunkUid, r: &mut R) -> Result<NodeData> {
    let n = r.read_u64::<BigEndian>()? as usize;
    let mut digests = Vec::with_capacity(n);
    for _ in 0..n {
        digests.push(r.read_u64::<BigEndian>()?);
    }
    let mut values = Vec::with_capacity(n);
    for _ in 0..n {
        values.push(PackedValue::read(r)?);
    }
    let mut expirations = Vec::with_capacity(n);
    for _ in 0..n {
        expirations.push(r.read_u64::<BigEndian>()?);
    }
    let mut children = Vec::with_capacity(n);
    for _ in 0..n {
        children.push(r.read_i64::<BigEndian>()?);
    }
    let mut links = Vec::with_capacity(n + 1);
    for _ in 0..=n {
        links.push(r.read_i64::<BigEndian>()?);
    }
    Ok(NodeData { uid, digests, values, expirations, children, links, on_disk: true, changed: false })
}

fn load_node(storage: &StorageFile, uid: ChunkUid) -> Result<NodeData> {
    let mut reader = storage.get_chain_reader(uid)?;
    deserialize(uid, &mut reader)
}

fn erase_value_chain(tx: &mut Transaction<'_>, value: &PackedValue) -> Result<()> {
    if value.type_index == 6 || value.type_index == 7 {
        let uid = value.payload as ChunkUid;
        if uid != INVALID_CHUNK_UID {
            tx.erase_chain(uid)?;
        }
    }
    Ok(())
}

/// A hierarchical index over one physical volume's path segments.
pub struct BTree<'a> {
    storage: &'a StorageFile,
    cache: &'a BTreeCache,
    root: Arc<Locked<NodeData>>,
}

impl<'a> BTree<'a> {
    /// Opens (and, for a freshly created file, deploys) the top-level tree.
    pub fn new(storage: &'a StorageFile, cache: &'a BTreeCache) -> Result<Self> {
        let root_uid = storage.root_uid();
        if storage.committed_file_size()? <= root_uid {
            let mut tx = storage.open_transaction()?;
            let node = empty_node();
            let mut w = tx.get_chain_writer();
            w.write_all(&serialize(&node))?;
            let uid = w.finish()?;
            debug_assert_eq!(uid, root_uid);
            tx.commit()?;
        }
        let root = cache.get(root_uid, || load_node(storage, root_uid))?;
        Ok(BTree { storage, cache, root })
    }

    pub fn root_uid(&self) -> ChunkUid {
        self.storage.root_uid()
    }

    fn load(&self, uid: ChunkUid) -> Result<Arc<Locked<NodeData>>> {
        if uid == self.root_uid() {
            return Ok(self.root.clone());
        }
        self.cache.get(uid, || load_node(self.storage, uid))
    }

    fn write_node(&self, tx: &mut Transaction<'a>, uid: ChunkUid, node: &NodeData) -> Result<()> {
        let mut w = tx.get_chain_overwriter(uid)?;
        w.write_all(&serialize(node))?;
        w.finish()?;
        Ok(())
    }

    fn create_node(&self, tx: &mut Transaction<'a>, node: &NodeData) -> Result<ChunkUid> {
        let mut w = tx.get_chain_writer();
        w.write_all(&serialize(node))?;
        w.finish()
    }

    fn cache_insert(&self, uid: ChunkUid, mut data: NodeData) -> Result<()> {
        data.uid = uid;
        self.cache.get(uid, || Ok(data))?;
        Ok(())
    }

    fn create_placeholder_root(&self, tx: &mut Transaction<'a>) -> Result<ChunkUid> {
        let data = empty_node();
        let uid = self.create_node(tx, &data)?;
        self.cache_insert(uid, data)?;
        Ok(uid)
    }

    /// Descends from `tree_root` toward `d`, recording `(node_uid,
    /// link_index)` for every internal node passed through. Stops as soon
    /// as `d` is found anywhere (internal node or leaf), or at the leaf
    /// where it would belong if absent.
    fn descend_find(&self, tree_root: ChunkUid, d: Digest) -> Result<(Vec<(ChunkUid, usize)>, Option<usize>, ChunkUid)> {
        let mut ancestors = Vec::new();
        let mut current = tree_root;
        loop {
            let node = self.load(current)?;
            let guard = node.read();
            match guard.digests.binary_search(&d) {
                Ok(i) => return Ok((ancestors, Some(i), current)),
                Err(i) => {
                    let link = guard.links[i];
                    if link == INVALID_CHUNK_UID {
                        return Ok((ancestors, None, current));
                    }
                    ancestors.push((current, i));
                    drop(guard);
                    current = link;
                }
            }
        }
    }

    fn rightmost(&self, start: ChunkUid) -> Result<(Vec<(ChunkUid, usize)>, ChunkUid, usize)> {
        let mut ancestors = Vec::new();
        let mut current = start;
        loop {
            let node = self.load(current)?;
            let guard = node.read();
            let n = guard.digests.len();
            let last_link = guard.links[n];
            if last_link == INVALID_CHUNK_UID {
                return Ok((ancestors, current, n - 1));
            }
            ancestors.push((current, n));
            drop(guard);
            current = last_link;
        }
    }

    /// Looks up a single digest within the tree rooted at `tree_root`,
    /// ignoring an entry whose expiration has elapsed.
    pub fn find_digest(&self, tree_root: ChunkUid, d: Digest) -> Result<bool> {
        let (_, idx, node_uid) = self.descend_find(tree_root, d)?;
        match idx {
            None => Ok(false),
            Some(i) => {
                let node = self.load(node_uid)?;
                let g = node.read();
                Ok(!is_expired(g.expirations[i]))
            }
        }
    }

    /// Inserts or overwrites a single digest entry within the tree rooted
    /// at `tree_root`, splitting nodes on overflow as needed.
    pub fn insert_leaf(
        &self,
        tx: &mut Transaction<'a>,
        tree_root: ChunkUid,
        d: Digest,
        value: PackedValue,
        expiration: u64,
        overwrite: bool,
    ) -> Result<()> {
        if expiration != 0 && is_expired(expiration) {
            return Err(Error::AlreadyExpired);
        }
        self.insert_digest(tx, tree_root, d, value, expiration, overwrite)
    }

    fn insert_digest(
        &self,
        tx: &mut Transaction<'a>,
        tree_root: ChunkUid,
        d: Digest,
        value: PackedValue,
        expiration: u64,
        overwrite: bool,
    ) -> Result<()> {
        let (ancestors, found_idx, node_uid) = self.descend_find(tree_root, d)?;
        if let Some(idx) = found_idx {
            let node = self.load(node_uid)?;
            let vacant = {
                let g = node.read();
                is_expired(g.expirations[idx]) || g.values[idx].type_index == NO_VALUE_TYPE
            };
            if !vacant && !overwrite {
                return Err(Error::AlreadyExists);
            }
            let mut g = node.write();
            erase_value_chain(tx, &g.values[idx])?;
            g.values[idx] = value;
            g.expirations[idx] = expiration;
            self.write_node(tx, node_uid, &g)?;
            return Ok(());
        }

        let leaf = self.load(node_uid)?;
        let idx = {
            let g = leaf.read();
            g.digests.binary_search(&d).unwrap_err()
        };
        {
            let mut g = leaf.write();
            g.digests.insert(idx, d);
            g.values.insert(idx, value);
            g.expirations.insert(idx, expiration);
            g.children.insert(idx, INVALID_CHUNK_UID);
            g.links.insert(idx, INVALID_CHUNK_UID);
            self.write_node(tx, node_uid, &g)?;
        }

        self.split_up(tx, node_uid, ancestors)
    }

    fn split_up(&self, tx: &mut Transaction<'a>, mut node_uid: ChunkUid, mut ancestors: Vec<(ChunkUid, usize)>) -> Result<()> {
        let power = self.storage.policy().btree_power;
        loop {
            let overflow = {
                let node = self.load(node_uid)?;
                let g = node.read();
                g.digests.len() > power
            };
            if !overflow {
                return Ok(());
            }

            let node = self.load(node_uid)?;
            let (left_part, right_part, promoted) = {
                let g = node.read();
                let n = g.digests.len();
                let mid = n / 2;
                let left = NodeData {
                    uid: 0,
                    digests: g.digests[..mid].to_vec(),
                    values: g.values[..mid].to_vec(),
                    expirations: g.expirations[..mid].to_vec(),
                    children: g.children[..mid].to_vec(),
                    links: g.links[..=mid].to_vec(),
                    on_disk: true,
                    changed: true,
                };
                let right = NodeData {
                    uid: 0,
                    digests: g.digests[mid + 1..].to_vec(),
                    values: g.values[mid + 1..].to_vec(),
                    expirations: g.expirations[mid + 1..].to_vec(),
                    children: g.children[mid + 1..].to_vec(),
                    links: g.links[mid + 1..].to_vec(),
                    on_disk: true,
                    changed: true,
                };
                let promoted = (g.digests[mid], g.values[mid], g.expirations[mid], g.children[mid]);
                (left, right, promoted)
            };

            if ancestors.is_empty() {
                let left_uid = self.create_node(tx, &left_part)?;
                let right_uid = self.create_node(tx, &right_part)?;
                self.cache_insert(left_uid, left_part)?;
                self.cache_insert(right_uid, right_part)?;

                let root = self.load(node_uid)?;
                let mut g = root.write();
                g.digests = vec![promoted.0];
                g.values = vec![promoted.1];
                g.expirations = vec![promoted.2];
                g.children = vec![promoted.3];
                g.links = vec![left_uid, right_uid];
                self.write_node(tx, node_uid, &g)?;
                return Ok(());
            }

            {
                let cur = self.load(node_uid)?;
                let mut g = cur.write();
                g.digests = left_part.digests;
                g.values = left_part.values;
                g.expirations = left_part.expirations;
                g.children = left_part.children;
                g.links = left_part.links;
                self.write_node(tx, node_uid, &g)?;
            }
            let right_uid = self.create_node(tx, &right_part)?;
            self.cache_insert(right_uid, right_part)?;

            let (parent_uid, child_idx) = ancestors.pop().expect("non-root overflow has a parent");
            let parent = self.load(parent_uid)?;
            {
                let mut g = parent.write();
                g.digests.insert(child_idx, promoted.0);
                g.values.insert(child_idx, promoted.1);
                g.expirations.insert(child_idx, promoted.2);
                g.children.insert(child_idx, promoted.3);
                g.links.insert(child_idx + 1, right_uid);
                self.write_node(tx, parent_uid, &g)?;
            }
            node_uid = parent_uid;
        }
    }

    /// Removes a single digest entry from the tree rooted at `tree_root`.
    /// Fails with [`Error::HasChildren`] if the entry has a populated
    /// `children` subtree, unless `force` is set, in which case the whole
    /// subtree is erased along with it.
    pub fn erase(&self, tx: &mut Transaction<'a>, tree_root: ChunkUid, d: Digest, force: bool) -> Result<()> {
        let (ancestors, found_idx, node_uid) = self.descend_find(tree_root, d)?;
        let idx = found_idx.ok_or(Error::NotFound)?;

        let (children, old_value) = {
            let node = self.load(node_uid)?;
            let g = node.read();
            (g.children[idx], g.values[idx])
        };
        if children != INVALID_CHUNK_UID && !force {
            return Err(Error::HasChildren);
        }
        if children != INVALID_CHUNK_UID {
            self.erase_subtree_fully(tx, children)?;
        }
        erase_value_chain(tx, &old_value)?;

        let mut ancestors = ancestors;
        let mut node_uid = node_uid;
        let mut idx = idx;
        loop {
            let node = self.load(node_uid)?;
            let leaf = {
                let g = node.read();
                is_leaf(&g)
            };
            if leaf {
                let mut g = node.write();
                g.digests.remove(idx);
                g.values.remove(idx);
                g.expirations.remove(idx);
                g.children.remove(idx);
                g.links.remove(idx);
                self.write_node(tx, node_uid, &g)?;
                break;
            }

            let pred_subtree = {
                let g = node.read();
                g.links[idx]
            };
            let (pred_ancestors, pred_uid, pred_idx) = self.rightmost(pred_subtree)?;
            let pred_entry = {
                let pred_node = self.load(pred_uid)?;
                let g = pred_node.read();
                (g.digests[pred_idx], g.values[pred_idx], g.expirations[pred_idx], g.children[pred_idx])
            };
            {
                let mut g = node.write();
                g.digests[idx] = pred_entry.0;
                g.values[idx] = pred_entry.1;
                g.expirations[idx] = pred_entry.2;
                g.children[idx] = pred_entry.3;
                self.write_node(tx, node_uid, &g)?;
            }
            ancestors.push((node_uid, idx));
            ancestors.extend(pred_ancestors);
            node_uid = pred_uid;
            idx = pred_idx;
        }

        self.rebalance_up(tx, tree_root, node_uid, ancestors)
    }

    fn erase_subtree_fully(&self, tx: &mut Transaction<'a>, root: ChunkUid) -> Result<()> {
        let data = {
            let node = self.load(root)?;
            let g = node.read();
            g.clone()
        };
        for &child in &data.children {
            if child != INVALID_CHUNK_UID {
                self.erase_subtree_fully(tx, child)?;
            }
        }
        for value in &data.values {
            erase_value_chain(tx, value)?;
        }
        for &link in &data.links {
            if link != INVALID_CHUNK_UID {
                self.erase_subtree_fully(tx, link)?;
            }
        }
        tx.erase_chain(root)?;
        self.cache.drop_uid(root);
        Ok(())
    }

    fn rebalance_up(
        &self,
        tx: &mut Transaction<'a>,
        tree_root: ChunkUid,
        mut node_uid: ChunkUid,
        mut ancestors: Vec<(ChunkUid, usize)>,
    ) -> Result<()> {
        let min = self.storage.policy().btree_min_power;
        loop {
            let underflow = {
                let node = self.load(node_uid)?;
                let g = node.read();
                node_uid != tree_root && g.digests.len() < min
            };
            if !underflow {
                if node_uid == tree_root {
                    self.maybe_shrink_root(tx, tree_root)?;
                }
                return Ok(());
            }
            let (parent_uid, child_idx) = ancestors.pop().expect("non-root underflow has a parent");
            self.fix_underflow(tx, parent_uid, child_idx)?;
            node_uid = parent_uid;
        }
    }

    fn maybe_shrink_root(&self, tx: &mut Transaction<'a>, root_uid: ChunkUid) -> Result<()> {
        let shrink = {
            let node = self.load(root_uid)?;
            let g = node.read();
            g.digests.is_empty() && g.links[0] != INVALID_CHUNK_UID
        };
        if !shrink {
            return Ok(());
        }
        let child_uid = {
            let node = self.load(root_uid)?;
            let g = node.read();
            g.links[0]
        };
        let child_data = {
            let child = self.load(child_uid)?;
            let g = child.read();
            g.clone()
        };
        {
            let root = self.load(root_uid)?;
            let mut g = root.write();
            g.digests = child_data.digests;
            g.values = child_data.values;
            g.expirations = child_data.expirations;
            g.children = child_data.children;
            g.links = child_data.links;
            self.write_node(tx, root_uid, &g)?;
        }
        tx.erase_chain(child_uid)?;
        self.cache.drop_uid(child_uid);
        Ok(())
    }

    fn fix_underflow(&self, tx: &mut Transaction<'a>, parent_uid: ChunkUid, child_idx: usize) -> Result<()> {
        let parent = self.load(parent_uid)?;
        let (left_uid, right_uid, child_uid) = {
            let g = parent.read();
            let left = if child_idx > 0 { Some(g.links[child_idx - 1]) } else { None };
            let right = if child_idx + 1 < g.links.len() { Some(g.links[child_idx + 1]) } else { None };
            (left, right, g.links[child_idx])
        };
        let min = self.storage.policy().btree_min_power;

        if let Some(left_uid) = left_uid {
            let can_borrow = {
                let left = self.load(left_uid)?;
                let g = left.read();
                g.digests.len() > min
            };
            if can_borrow {
                return self.borrow_from_left(tx, parent_uid, child_idx, left_uid, child_uid);
            }
        }
        if let Some(right_uid) = right_uid {
            let can_borrow = {
                let right = self.load(right_uid)?;
                let g = right.read();
                g.digests.len() > min
            };
            if can_borrow {
                return self.borrow_from_right(tx, parent_uid, child_idx, child_uid, right_uid);
            }
        }
        if let Some(left_uid) = left_uid {
            self.merge_children(tx, parent_uid, child_idx - 1, left_uid, child_uid)
        } else if let Some(right_uid) = right_uid {
            self.merge_children(tx, parent_uid, child_idx, child_uid, right_uid)
        } else {
            Ok(())
        }
    }

    fn borrow_from_left(
        &self,
        tx: &mut Transaction<'a>,
        parent_uid: ChunkUid,
        child_idx: usize,
        left_uid: ChunkUid,
        child_uid: ChunkUid,
    ) -> Result<()> {
        let parent = self.load(parent_uid)?;
        let left = self.load(left_uid)?;
        let child = self.load(child_uid)?;
        let sep_idx = child_idx - 1;

        let sep = {
            let g = parent.read();
            (g.digests[sep_idx], g.values[sep_idx], g.expirations[sep_idx], g.children[sep_idx])
        };
        let pulled = {
            let mut g = left.write();
            let entry = (
                g.digests.pop().unwrap(),
                g.values.pop().unwrap(),
                g.expirations.pop().unwrap(),
                g.children.pop().unwrap(),
                g.links.pop().unwrap(),
            );
            self.write_node(tx, left_uid, &g)?;
            entry
        };
        {
            let mut g = child.write();
            g.digests.insert(0, sep.0);
            g.values.insert(0, sep.1);
            g.expirations.insert(0, sep.2);
            g.children.insert(0, sep.3);
            g.links.insert(0, pulled.4);
            self.write_node(tx, child_uid, &g)?;
        }
        {
            let mut g = parent.write();
            g.digests[sep_idx] = pulled.0;
            g.values[sep_idx] = pulled.1;
            g.expirations[sep_idx] = pulled.2;
            g.children[sep_idx] = pulled.3;
            self.write_node(tx, parent_uid, &g)?;
        }
        Ok(())
    }

    fn borrow_from_right(
        &self,
        tx: &mut Transaction<'a>,
        parent_uid: ChunkUid,
        child_idx: usize,
        child_uid: ChunkUid,
        right_uid: ChunkUid,
    ) -> Result<()> {
        let parent = self.load(parent_uid)?;
        let right = self.load(right_uid)?;
        let child = self.load(child_uid)?;
        let sep_idx = child_idx;

        let sep = {
            let g = parent.read();
            (g.digests[sep_idx], g.values[sep_idx], g.expirations[sep_idx], g.children[sep_idx])
        };
        let pulled = {
            let mut g = right.write();
            let entry = (
                g.digests.remove(0),
                g.values.remove(0),
                g.expirations.remove(0),
                g.children.remove(0),
                g.links.remove(0),
            );
            self.write_node(tx, right_uid, &g)?;
            entry
        };
        {
            let mut g = child.write();
            g.digests.push(sep.0);
            g.values.push(sep.1);
            g.expirations.push(sep.2);
            g.children.push(sep.3);
            g.links.push(pulled.4);
            self.write_node(tx, child_uid, &g)?;
        }
        {
            let mut g = parent.write();
            g.digests[sep_idx] = pulled.0;
            g.values[sep_idx] = pulled.1;
            g.expirations[sep_idx] = pulled.2;
            g.children[sep_idx] = pulled.3;
            self.write_node(tx, parent_uid, &g)?;
        }
        Ok(())
    }

    fn merge_children(
        &self,
        tx: &mut Transaction<'a>,
        parent_uid: ChunkUid,
        sep_idx: usize,
        left_uid: ChunkUid,
        right_uid: ChunkUid,
    ) -> Result<()> {
        let parent = self.load(parent_uid)?;
        let left = self.load(left_uid)?;
        let right = self.load(right_uid)?;

        let sep = {
            let g = parent.read();
            (g.digests[sep_idx], g.values[sep_idx], g.expirations[sep_idx], g.children[sep_idx])
        };
        let right_data = {
            let g = right.read();
            g.clone()
        };
        {
            let mut g = left.write();
            g.digests.push(sep.0);
            g.values.push(sep.1);
            g.expirations.push(sep.2);
            g.children.push(sep.3);
            g.digests.extend(right_data.digests);
            g.values.extend(right_data.values);
            g.expirations.extend(right_data.expirations);
            g.children.extend(right_data.children);
            g.links.pop();
            g.links.extend(right_data.links);
            self.write_node(tx, left_uid, &g)?;
        }
        tx.erase_chain(right_uid)?;
        self.cache.drop_uid(right_uid);
        {
            let mut g = parent.write();
            g.digests.remove(sep_idx);
            g.values.remove(sep_idx);
            g.expirations.remove(sep_idx);
            g.children.remove(sep_idx);
            g.links.remove(sep_idx + 1);
            self.write_node(tx, parent_uid, &g)?;
        }
        Ok(())
    }

    /// Looks up a whole hierarchical path, descending through nested
    /// `children` subtrees one segment at a time.
    pub fn get(&self, key: &Key<'_>) -> Result<Option<Value>> {
        let segments: Vec<&str> = key.segments().collect();
        if segments.is_empty() {
            return Ok(None);
        }
        let mut current_root = self.root_uid();
        for (i, segment) in segments.iter().enumerate() {
            let d = digest_segment(segment);
            let (_, idx, node_uid) = self.descend_find(current_root, d)?;
            let idx = match idx {
                Some(idx) => idx,
                None => return Ok(None),
            };
            let node = self.load(node_uid)?;
            let g = node.read();
            let is_last = i + 1 == segments.len();
            if is_last {
                if is_expired(g.expirations[idx]) || g.values[idx].type_index == NO_VALUE_TYPE {
                    return Ok(None);
                }
                return Ok(Some(value::unpack(self.storage, &g.values[idx])?));
            }
            if is_expired(g.expirations[idx]) {
                return Ok(None);
            }
            let children = g.children[idx];
            if children == INVALID_CHUNK_UID {
                return Ok(None);
            }
            current_root = children;
        }
        unreachable!("segments is non-empty, so the loop always returns")
    }

    /// Inserts a value at a whole hierarchical path, creating nested
    /// `children` subtrees for any intermediate segment that doesn't have
    /// one yet.
    pub fn insert(&self, tx: &mut Transaction<'a>, key: &Key<'_>, value: Value, expiration: u64, overwrite: bool) -> Result<()> {
        let segments: Vec<&str> = key.segments().collect();
        if segments.is_empty() {
            return Err(Error::InvalidLogicalPath);
        }
        if expiration != 0 && is_expired(expiration) {
            return Err(Error::AlreadyExpired);
        }

        let mut current_root = self.root_uid();
        for (i, segment) in segments.iter().enumerate() {
            let d = digest_segment(segment);
            let is_last = i + 1 == segments.len();
            if is_last {
                let packed = value::pack(tx, &value)?;
                return self.insert_digest(tx, current_root, d, packed, expiration, overwrite);
            }

            let (_, idx, node_uid) = self.descend_find(current_root, d)?;
            current_root = match idx {
                Some(idx) => {
                    let node = self.load(node_uid)?;
                    let children = {
                        let g = node.read();
                        g.children[idx]
                    };
                    if children == INVALID_CHUNK_UID {
                        let new_root = self.create_placeholder_root(tx)?;
                        let mut g = node.write();
                        g.children[idx] = new_root;
                        self.write_node(tx, node_uid, &g)?;
                        new_root
                    } else {
                        children
                    }
                }
                None => {
                    let new_root = self.create_placeholder_root(tx)?;
                    let placeholder = PackedValue { type_index: NO_VALUE_TYPE, payload: 0 };
                    self.insert_digest(tx, current_root, d, placeholder, 0, true)?;
                    let (_, idx2, node_uid2) = self.descend_find(current_root, d)?;
                    let idx2 = idx2.expect("entry was just inserted");
                    let node = self.load(node_uid2)?;
                    let mut g = node.write();
                    g.children[idx2] = new_root;
                    self.write_node(tx, node_uid2, &g)?;
                    new_root
                }
            };
        }
        unreachable!("segments is non-empty, so the loop always returns")
    }

    /// Removes the value (and, with `force`, the whole nested subtree) at
    /// a whole hierarchical path.
    pub fn remove(&self, tx: &mut Transaction<'a>, key: &Key<'_>, force: bool) -> Result<()> {
        let segments: Vec<&str> = key.segments().collect();
        if segments.is_empty() {
            return Err(Error::InvalidLogicalPath);
        }
        let mut current_root = self.root_uid();
        for (i, segment) in segments.iter().enumerate() {
            let d = digest_segment(segment);
            let is_last = i + 1 == segments.len();
            if is_last {
                return self.erase(tx, current_root, d, force);
            }
            let (_, idx, node_uid) = self.descend_find(current_root, d)?;
            let idx = idx.ok_or(Error::NotFound)?;
            let node = self.load(node_uid)?;
            let children = {
                let g = node.read();
                g.children[idx]
            };
            if children == INVALID_CHUNK_UID {
                return Err(Error::NotFound);
            }
            current_root = children;
        }
        unreachable!("segments is non-empty, so the loop always returns")
    }
}

fn empty_node() -> NodeData {
    NodeData {
        uid: 0,
        digests: Vec::new(),
        values: Vec::new(),
        expirations: Vec::new(),
        children: Vec::new(),
        links: vec![INVALID_CHUNK_UID],
        on_disk: false,
        changed: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BTreeCache;
    use crate::Policy;

    fn open(policy: Policy) -> (tempfile::TempDir, StorageFile, BTreeCache) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.jb");
        let storage = StorageFile::open(&path, policy).unwrap();
        let cache = BTreeCache::new(policy.btree_cache_size);
        (dir, storage, cache)
    }

    fn packed(v: u64) -> PackedValue {
        PackedValue { type_index: 1, payload: v }
    }

    #[test]
    fn insert_then_find_round_trip() {
        let (_dir, storage, cache) = open(Policy::default());
        let tree = BTree::new(&storage, &cache).unwrap();
        let root = tree.root_uid();
        let mut tx = storage.open_transaction().unwrap();
        tree.insert_leaf(&mut tx, root, 42, packed(1), 0, false).unwrap();
        tx.commit().unwrap();
        assert!(tree.find_digest(root, 42).unwrap());
        assert!(!tree.find_digest(root, 43).unwrap());
    }

    #[test]
    fn duplicate_insert_without_overwrite_fails() {
        let (_dir, storage, cache) = open(Policy::default());
        let tree = BTree::new(&storage, &cache).unwrap();
        let root = tree.root_uid();
        let mut tx = storage.open_transaction().unwrap();
        tree.insert_leaf(&mut tx, root, 7, packed(1), 0, false).unwrap();
        let result = tree.insert_leaf(&mut tx, root, 7, packed(2), 0, false);
        assert!(matches!(result, Err(Error::AlreadyExists)));
        tree.insert_leaf(&mut tx, root, 7, packed(2), 0, true).unwrap();
        tx.commit().unwrap();
    }

    #[test]
    fn many_inserts_force_a_split_and_stay_findable() {
        let policy = Policy { btree_power: 4, btree_min_power: 2, ..Policy::default() };
        let (_dir, storage, cache) = open(policy);
        let tree = BTree::new(&storage, &cache).unwrap();
        let root = tree.root_uid();
        let mut tx = storage.open_transaction().unwrap();
        for d in 0..200u64 {
            tree.insert_leaf(&mut tx, root, d, packed(d), 0, false).unwrap();
        }
        tx.commit().unwrap();
        for d in 0..200u64 {
            assert!(tree.find_digest(root, d).unwrap(), "digest {d} should be findable");
        }
        assert!(!tree.find_digest(root, 9999).unwrap());
    }

    #[test]
    fn path_insert_and_get_round_trip() {
        let (_dir, storage, cache) = open(Policy::default());
        let tree = BTree::new(&storage, &cache).unwrap();
        for i in 0..50u32 {
            let key = format!("/k/{i}");
            let mut tx = storage.open_transaction().unwrap();
            tree.insert(&mut tx, &Key::new(&key).unwrap(), Value::U32(i), 0, false).unwrap();
            tx.commit().unwrap();
        }
        for i in 0..50u32 {
            let key = format!("/k/{i}");
            assert_eq!(tree.get(&Key::new(&key).unwrap()).unwrap(), Some(Value::U32(i)));
        }
        assert_eq!(tree.get(&Key::new("/k/1000").unwrap()).unwrap(), None);
    }

    #[test]
    fn intermediate_path_with_no_value_reads_as_absent() {
        let (_dir, storage, cache) = open(Policy::default());
        let tree = BTree::new(&storage, &cache).unwrap();
        let mut tx = storage.open_transaction().unwrap();
        tree.insert(&mut tx, &Key::new("/a/b").unwrap(), Value::U32(1), 0, false).unwrap();
        tx.commit().unwrap();
        assert_eq!(tree.get(&Key::new("/a").unwrap()).unwrap(), None);
        assert_eq!(tree.get(&Key::new("/a/b").unwrap()).unwrap(), Some(Value::U32(1)));
    }

    #[test]
    fn erase_rejects_then_force_erases_children() {
        let (_dir, storage, cache) = open(Policy::default());
        let tree = BTree::new(&storage, &cache).unwrap();
        let mut tx = storage.open_transaction().unwrap();
        tree.insert(&mut tx, &Key::new("/a/b").unwrap(), Value::U32(1), 0, false).unwrap();
        tree.insert(&mut tx, &Key::new("/a").unwrap(), Value::U32(0), 0, false).unwrap();
        tx.commit().unwrap();

        let mut tx = storage.open_transaction().unwrap();
        let result = tree.remove(&mut tx, &Key::new("/a").unwrap(), false);
        assert!(matches!(result, Err(Error::HasChildren)));
        tree.remove(&mut tx, &Key::new("/a").unwrap(), true).unwrap();
        tx.commit().unwrap();

        assert_eq!(tree.get(&Key::new("/a").unwrap()).unwrap(), None);
        assert_eq!(tree.get(&Key::new("/a/b").unwrap()).unwrap(), None);
    }

    #[test]
    fn erase_many_triggers_merges_and_the_rest_survive() {
        let policy = Policy { btree_power: 4, btree_min_power: 2, ..Policy::default() };
        let (_dir, storage, cache) = open(policy);
        let tree = BTree::new(&storage, &cache).unwrap();
        let root = tree.root_uid();
        let mut tx = storage.open_transaction().unwrap();
        for d in 0..100u64 {
            tree.insert_leaf(&mut tx, root, d, packed(d), 0, false).unwrap();
        }
        tx.commit().unwrap();

        let mut tx = storage.open_transaction().unwrap();
        for d in 0..80u64 {
            tree.erase(&mut tx, root, d, false).unwrap();
        }
        tx.commit().unwrap();

        for d in 0..80u64 {
            assert!(!tree.find_digest(root, d).unwrap());
        }
        for d in 80..100u64 {
            assert!(tree.find_digest(root, d).unwrap());
        }
    }

    #[test]
    fn insert_with_past_expiration_is_rejected() {
        let (_dir, storage, cache) = open(Policy::default());
        let tree = BTree::new(&storage, &cache).unwrap();
        let root = tree.root_uid();
        let mut tx = storage.open_transaction().unwrap();
        let result = tree.insert_leaf(&mut tx, root, 1, packed(1), 1, false);
        assert!(matches!(result, Err(Error::AlreadyExpired)));
    }

    #[test]
    fn expired_entry_reads_as_absent() {
        let (_dir, storage, cache) = open(Policy::default());
        let tree = BTree::new(&storage, &cache).unwrap();
        let mut tx = storage.open_transaction().unwrap();
        let soon = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 1;
        tree.insert(&mut tx, &Key::new("/temp").unwrap(), Value::U32(1), soon, false).unwrap();
        tx.commit().unwrap();
        assert_eq!(tree.get(&Key::new("/temp").unwrap()).unwrap(), Some(Value::U32(1)));
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert_eq!(tree.get(&Key::new("/temp").unwrap()).unwrap(), None);
    }
}
