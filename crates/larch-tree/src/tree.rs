//! The B^ε-tree: root pointer, tuning, durability, and adaptivity.

use crate::node::{self, Limits, MessageMap, Node, TreeCtx};
use crate::state::WorkloadState;
use larch_common::{
    Combine, Datum, LarchError, Message, MessageKey, Opcode, Result, StorageConfig, TreeConfig,
};
use larch_store::{BackingStore, FileBackingStore};
use larch_swap::{ObjRef, SwapSpace};
use larch_wal::{Cadence, LogRecord, Status, Wal};
use std::collections::VecDeque;

/// A write-optimized key-value index.
///
/// Mutations are logged, stamped with a monotonically increasing timestamp
/// (the LSN), and flushed into the root as single-message batches; queries
/// descend from the root merging buffered messages with deeper values.
/// Checkpoints snapshot the durable image (object files + metadata table +
/// status file) and recovery replays the log tail on top of it.
pub struct Betree<K: Datum + Ord, V: Datum + Combine> {
    ss: SwapSpace<Node<K, V>>,
    wal: Wal<K, V>,
    storage: StorageConfig,
    limits: Limits,
    min_node_size: u64,
    epsilon: f64,
    write_heavy_epsilon: f64,
    read_heavy_epsilon: f64,
    shorten_on_read_heavy: bool,
    state: WorkloadState,
    root: ObjRef,
    next_timestamp: u64,
    default_value: V,
    split_counter: u64,
}

impl<K: Datum + Ord, V: Datum + Combine> Betree<K, V> {
    /// Builds a tree over a file backing store rooted at the configured
    /// data directory. No recovery is attempted; see [`Betree::open`].
    pub fn new(tree_config: TreeConfig, storage: StorageConfig, default_value: V) -> Result<Self> {
        let mut store = FileBackingStore::new(&storage.data_dir)?;
        if !storage.fsync_enabled {
            store = store.without_fsync();
        }
        Self::with_store(Box::new(store), tree_config, storage, default_value)
    }

    /// Builds a tree over a caller-provided backing store. The store must
    /// read and write under `storage.data_dir` for recovery's backup copy
    /// to line up.
    pub fn with_store(
        store: Box<dyn BackingStore>,
        tree_config: TreeConfig,
        storage: StorageConfig,
        default_value: V,
    ) -> Result<Self> {
        tree_config.validate()?;
        storage.validate()?;

        let mut ss = SwapSpace::new(store, storage.cache_size);
        let wal = Wal::open(
            &storage.log_file,
            storage.persist_every,
            storage.checkpoint_every,
            storage.fsync_enabled,
        )?;
        let root = ss.allocate(Node::new())?;

        let mut tree = Self {
            ss,
            wal,
            limits: Limits {
                max_node_size: tree_config.max_node_size,
                min_flush_size: tree_config.min_flush_size,
                pivot_upper_bound: 0,
                message_upper_bound: 0,
            },
            min_node_size: tree_config.min_node_size,
            epsilon: tree_config.epsilon,
            write_heavy_epsilon: tree_config.write_heavy_epsilon,
            read_heavy_epsilon: tree_config.read_heavy_epsilon,
            shorten_on_read_heavy: tree_config.shorten_on_read_heavy,
            state: WorkloadState::from_level(tree_config.initial_state)?,
            storage,
            root,
            next_timestamp: 1,
            default_value,
            split_counter: 0,
        };
        tree.set_epsilon(tree_config.epsilon)?;
        Ok(tree)
    }

    /// Builds a tree and recovers from the last checkpoint if one exists.
    pub fn open(tree_config: TreeConfig, storage: StorageConfig, default_value: V) -> Result<Self> {
        let mut tree = Self::new(tree_config, storage, default_value)?;
        tree.recover()?;
        Ok(tree)
    }

    fn ctx(&mut self) -> TreeCtx<'_, K, V> {
        TreeCtx {
            ss: &mut self.ss,
            limits: self.limits,
            default_value: &self.default_value,
            split_counter: &mut self.split_counter,
        }
    }

    // ---- tuning ----

    /// Re-derives the pivot and message budgets from a new epsilon.
    pub fn set_epsilon(&mut self, epsilon: f64) -> Result<()> {
        if !(epsilon > 0.0 && epsilon < 1.0) {
            return Err(LarchError::InvalidParameter {
                name: "epsilon".to_string(),
                value: epsilon.to_string(),
            });
        }
        self.epsilon = epsilon;
        self.limits.pivot_upper_bound =
            (self.limits.max_node_size as f64).powf(epsilon).floor() as u64;
        self.limits.message_upper_bound = self.limits.max_node_size - self.limits.pivot_upper_bound;
        Ok(())
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn state(&self) -> WorkloadState {
        self.state
    }

    pub fn set_state(&mut self, state: WorkloadState) {
        self.state = state;
    }

    pub fn pivot_upper_bound(&self) -> u64 {
        self.limits.pivot_upper_bound
    }

    pub fn message_upper_bound(&self) -> u64 {
        self.limits.message_upper_bound
    }

    pub fn max_node_size(&self) -> u64 {
        self.limits.max_node_size
    }

    pub fn min_flush_size(&self) -> u64 {
        self.limits.min_flush_size
    }

    pub fn min_node_size(&self) -> u64 {
        self.min_node_size
    }

    /// Total number of node splits performed so far.
    pub fn split_count(&self) -> u64 {
        self.split_counter
    }

    /// The root's object id, as recorded in the status file.
    pub fn root_id(&self) -> u64 {
        self.root.id()
    }

    pub(crate) fn default_value(&self) -> &V {
        &self.default_value
    }

    // ---- mutation and lookup ----

    /// Logs and applies one mutation, then runs the persist/checkpoint
    /// cadence check.
    pub fn upsert(&mut self, opcode: Opcode, key: K, value: V) -> Result<()> {
        let mkey = MessageKey::new(key.clone(), self.next_timestamp);
        self.next_timestamp += 1;
        let msg = Message::new(opcode, value.clone());
        self.wal.log(LogRecord::new(mkey.clone(), msg.clone()));

        let mut batch = MessageMap::new();
        batch.insert(mkey, msg);
        let root = self.root;
        let new_pivots = {
            let mut ctx = self.ctx();
            node::flush(&mut ctx, root, batch)?
        };
        if !new_pivots.is_empty() {
            let mut new_root = Node::new();
            new_root.pivots = new_pivots;
            let new_ref = self.ss.allocate(new_root)?;
            self.ss.release(self.root);
            self.root = new_ref;
            tracing::debug!(root = new_ref.id(), "root split");
        }

        self.maybe_persist_or_checkpoint(key, value)
    }

    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        self.upsert(Opcode::Insert, key, value)
    }

    pub fn update(&mut self, key: K, value: V) -> Result<()> {
        self.upsert(Opcode::Update, key, value)
    }

    pub fn delete(&mut self, key: K) -> Result<()> {
        let default = self.default_value.clone();
        self.upsert(Opcode::Delete, key, default)
    }

    /// Point lookup. `Ok(None)` means the key is absent or shadowed by a
    /// tombstone.
    pub fn query(&mut self, key: &K) -> Result<Option<V>> {
        let root = self.root;
        let mut ctx = self.ctx();
        node::query(&mut ctx, root, key)
    }

    /// Coalesces runs of small root children. Not part of the mutation
    /// path.
    pub fn merge_small_children(&mut self) -> Result<()> {
        let root = self.root;
        let min_node_size = self.min_node_size;
        let mut ctx = self.ctx();
        node::merge_small_children(&mut ctx, root, min_node_size)
    }

    pub(crate) fn first_message_from(
        &mut self,
        bound: Option<&MessageKey<K>>,
    ) -> Result<Option<(MessageKey<K>, Message<V>)>> {
        let root = self.root;
        let mut ctx = self.ctx();
        node::first_message_after(&mut ctx, root, bound)
    }

    /// Ordered traversal of live (key, value) pairs.
    pub fn cursor(&mut self) -> crate::cursor::Cursor<'_, K, V> {
        crate::cursor::Cursor::new(self, None)
    }

    /// Ordered traversal starting at the first key >= `key`.
    pub fn cursor_from(&mut self, key: &K) -> crate::cursor::Cursor<'_, K, V> {
        crate::cursor::Cursor::new(self, Some(MessageKey::range_start(key)))
    }

    // ---- adaptive shape ----

    /// Feeds the recent write ratio into the workload state machine.
    ///
    /// Ratios above 0.7 walk the state toward write-heavy, below 0.3
    /// toward read-heavy, one step per report. Reaching an extreme retunes
    /// epsilon (and optionally shortens the tree) when the shape does not
    /// match yet; the `Fixed` state disables everything.
    pub fn observe_write_ratio(&mut self, write_ratio: f64) -> Result<()> {
        let Some(level) = self.state.level() else {
            return Ok(());
        };

        let mut level = level;
        if write_ratio > 0.7 && level > 0 {
            level -= 1;
        }
        if write_ratio < 0.3 && level < 3 {
            level += 1;
        }
        let new_state = WorkloadState::from_level(level)?;
        if new_state == self.state {
            return Ok(());
        }
        self.state = new_state;

        if new_state == WorkloadState::WriteHeavy && self.epsilon != self.write_heavy_epsilon {
            tracing::info!(
                epsilon = self.write_heavy_epsilon,
                "workload turned write-heavy, lowering epsilon"
            );
            self.set_epsilon(self.write_heavy_epsilon)?;
        }
        if new_state == WorkloadState::ReadHeavy && self.epsilon != self.read_heavy_epsilon {
            tracing::info!(
                epsilon = self.read_heavy_epsilon,
                "workload turned read-heavy, raising epsilon"
            );
            self.set_epsilon(self.read_heavy_epsilon)?;
            if self.shorten_on_read_heavy {
                self.shorten_betree()?;
            }
        }
        Ok(())
    }

    /// Reduces tree height by splicing grandchildren into their
    /// grandparents, breadth-first from the root.
    pub fn shorten_betree(&mut self) -> Result<()> {
        tracing::info!("shortening tree");
        let mut frontier = VecDeque::from([self.root]);
        while let Some(node_ref) = frontier.pop_front() {
            let mut ctx = self.ctx();
            let children = node::shorten_node(&mut ctx, node_ref)?;
            frontier.extend(children);
        }
        Ok(())
    }

    // ---- statistics ----

    fn leaf_depths(&mut self) -> Result<(u64, u64, u64)> {
        let mut leaves = 0u64;
        let mut total_depth = 0u64;
        let mut max_depth = 0u64;

        let mut frontier = vec![(self.root, 0u64)];
        while let Some((node_ref, depth)) = frontier.pop() {
            let rc = self.ss.deref(node_ref)?;
            let node = rc.borrow();
            if node.is_leaf() {
                leaves += 1;
                total_depth += depth;
                max_depth = max_depth.max(depth);
            } else {
                for info in node.pivots.values() {
                    frontier.push((info.child, depth + 1));
                }
            }
        }
        Ok((leaves, total_depth, max_depth))
    }

    /// Mean leaf depth, with the root at depth 0.
    pub fn average_leaf_depth(&mut self) -> Result<f64> {
        let (leaves, total_depth, _) = self.leaf_depths()?;
        Ok(total_depth as f64 / leaves as f64)
    }

    /// Depth of the deepest leaf, with the root at depth 0.
    pub fn height(&mut self) -> Result<u64> {
        let (_, _, max_depth) = self.leaf_depths()?;
        Ok(max_depth)
    }

    /// Walks the whole tree asserting the size invariants: leaves within
    /// `max_node_size` elements, internal nodes within the pivot budget,
    /// and every buffered message routable to a child.
    pub fn check_invariants(&mut self) -> Result<()> {
        let mut frontier = vec![self.root];
        while let Some(node_ref) = frontier.pop() {
            let rc = self.ss.deref(node_ref)?;
            let node = rc.borrow();
            if node.is_leaf() {
                assert!(
                    node.elements.len() as u64 <= self.limits.max_node_size,
                    "leaf {} holds {} elements, cap {}",
                    node_ref.id(),
                    node.elements.len(),
                    self.limits.max_node_size
                );
            } else {
                assert!(
                    node.pivots.len() as u64 <= self.limits.pivot_upper_bound,
                    "node {} holds {} pivots, cap {}",
                    node_ref.id(),
                    node.pivots.len(),
                    self.limits.pivot_upper_bound
                );
                if let (Some(min_pivot), Some(first_element)) =
                    (node.pivots.keys().next(), node.elements.keys().next())
                {
                    assert!(
                        first_element.key >= *min_pivot,
                        "node {} buffers a message below its smallest pivot",
                        node_ref.id()
                    );
                }
                for info in node.pivots.values() {
                    frontier.push(info.child);
                }
            }
        }
        Ok(())
    }

    // ---- durability ----

    fn maybe_persist_or_checkpoint(&mut self, key: K, value: V) -> Result<()> {
        match self.wal.cadence() {
            Cadence::Checkpoint => self.checkpoint(key, value),
            Cadence::Persist => {
                self.wal.persist()?;
                Status::update_persist_lsn(&self.storage.status_file, self.wal.last_persist_lsn)
            }
            Cadence::Idle => Ok(()),
        }
    }

    /// Takes an atomic snapshot of the durable state: drains the log,
    /// writes back and backs up every object file, appends a checkpoint
    /// marker, and rewrites the status and object-metadata files.
    pub fn checkpoint(&mut self, key: K, value: V) -> Result<()> {
        self.wal.persist()?;
        self.ss.flush_whole_tree(&self.storage.backup_dir)?;

        // The marker's payload is cosmetic; its LSN is what recovery needs.
        let mkey = MessageKey::new(key, self.next_timestamp);
        self.next_timestamp += 1;
        let record = LogRecord::new(mkey, Message::new(Opcode::Checkpoint, value));
        let lsn = record.lsn();
        self.wal.log(record);
        self.wal.persist()?;
        self.wal.last_checkpoint_lsn = lsn;

        Status {
            log_file_path: self.wal.path().to_path_buf(),
            root_id: self.root.id(),
            persist_lsn: self.wal.last_persist_lsn,
            checkpoint_lsn: self.wal.last_checkpoint_lsn,
        }
        .write(&self.storage.status_file)?;

        self.ss.serialize_objects(&self.storage.objects_file)?;
        tracing::info!(lsn, "checkpoint complete");
        Ok(())
    }

    /// Reconstitutes the tree from the last checkpoint image and replays
    /// the log tail. Returns false when no checkpoint exists.
    pub fn recover(&mut self) -> Result<bool> {
        if !self.storage.status_file.exists() || !self.storage.objects_file.exists() {
            return Ok(false);
        }
        tracing::info!("recovery start");

        // The backup image supersedes whatever survived in the live
        // directory.
        if self.storage.backup_dir.exists() {
            copy_dir_files(&self.storage.backup_dir, &self.storage.data_dir)?;
        }

        // The freshly constructed tree's root allocation must not linger.
        self.ss.clear_lru();
        self.ss.deserialize_objects(&self.storage.objects_file)?;
        let max_id = self.ss.max_id().ok_or_else(|| {
            LarchError::RecoveryFailed("objects file holds no objects".to_string())
        })?;
        self.ss.set_next_id(max_id + 1);

        let status = Status::read(&self.storage.status_file)?;
        self.root = ObjRef::from_id(status.root_id);
        self.wal.last_persist_lsn = status.persist_lsn;
        self.wal.last_checkpoint_lsn = status.checkpoint_lsn;
        self.next_timestamp = status.persist_lsn + 1;

        // Redo: replay the persisted tail on top of the checkpoint image.
        // Fresh timestamps start at persist_lsn + 1, so a replayed trace is
        // deterministic. Records beyond the persist watermark are dropped.
        let records = self
            .wal
            .read_range(status.checkpoint_lsn, status.persist_lsn)?;
        let replayed = records.len();
        for record in records {
            if record.msg.opcode == Opcode::Checkpoint {
                continue;
            }
            self.upsert(record.msg.opcode, record.mkey.key, record.msg.value)?;
        }
        tracing::info!(replayed, "recovery complete");
        Ok(true)
    }
}

/// Copies every regular file in `src` into `dst`.
fn copy_dir_files(src: &std::path::Path, dst: &std::path::Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            std::fs::copy(entry.path(), dst.join(entry.file_name()))?;
        }
    }
    Ok(())
}
