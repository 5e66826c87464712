use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use crossbeam_channel::{Receiver, Sender};
use indexmap::IndexMap;
use itertools::Itertools;
use tracing::trace;

use crate::engine::Graph;
use crate::error::ProcessingError;
use crate::operator::{Operator, Passthrough};
use crate::policy::{AcceptAll, Fifo, LoadShedding, Prioritization};
use crate::{EngineError, EngineResult, Record, Schema, TableId, Value};

/// A handle to a table in an [crate::Engine]
///
/// Handles are cheap to clone, every clone refers to the same table. Reads
/// through a handle never wait on the scheduler
#[derive(Clone)]
pub struct Table {
    pub(crate) inner: Arc<TableInner>,
    pub(crate) graph: Arc<Graph>,
}

pub(crate) struct TableInner {
    pub(crate) id: TableId,
    pub(crate) name: Arc<str>,
    pub(crate) schema: Arc<Schema>,

    /// The latest materialized record per key
    state: RwLock<BTreeMap<Value, Record>>,

    /// At most one unconsumed candidate per key, ordered by the first arrival
    /// of each key. Later candidates replace earlier ones in place
    pending: Mutex<IndexMap<Value, Record>>,

    /// Empty for root tables, left then right for joins
    pub(crate) parents: Vec<Weak<TableInner>>,
    children: RwLock<Vec<Arc<TableInner>>>,

    /// The operator and policies, only touched by whoever processes this table
    pub(crate) task: Mutex<Task>,

    wakeup: (Sender<()>, Receiver<()>),
    pub(crate) stats: Counters,
    last_failure: Mutex<Option<Arc<ProcessingError>>>,
}

pub(crate) struct Task {
    pub(crate) operator: Box<dyn Operator>,
    pub(crate) shedding: Box<dyn LoadShedding>,
    pub(crate) priority: Box<dyn Prioritization>,
}

impl Task {
    fn new(operator: Box<dyn Operator>) -> Self {
        Task {
            operator,
            shedding: Box::new(AcceptAll),
            priority: Box::new(Fifo),
        }
    }
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TableInner {
    pub(crate) fn new(
        name: Arc<str>,
        schema: Arc<Schema>,
        parents: &[&Arc<TableInner>],
        operator: Option<Box<dyn Operator>>,
    ) -> Self {
        TableInner {
            id: TableId::of(&name),
            name,
            schema,
            state: RwLock::new(BTreeMap::new()),
            pending: Mutex::new(IndexMap::new()),
            parents: parents.iter().map(|parent| Arc::downgrade(parent)).collect(),
            children: RwLock::new(Vec::new()),
            task: Mutex::new(Task::new(operator.unwrap_or_else(|| Box::new(Passthrough)))),
            wakeup: crossbeam_channel::bounded(1),
            stats: Counters::default(),
            last_failure: Mutex::new(None),
        }
    }

    pub(crate) fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    pub(crate) fn add_child(&self, child: Arc<TableInner>) {
        write(&self.children).push(child);
    }

    pub(crate) fn children(&self) -> Vec<Arc<TableInner>> {
        read(&self.children).clone()
    }

    pub(crate) fn get(&self, key: &Value) -> Option<Record> {
        read(&self.state).get(key).cloned()
    }

    pub(crate) fn materialize(&self, record: Record) {
        write(&self.state).insert(record.key().clone(), record);
        self.stats.materialized.fetch_add(1, Ordering::Relaxed);
    }

    /// Buffers a candidate, coalescing with any unconsumed candidate for the
    /// same key, and wakes this table's worker
    pub(crate) fn offer(&self, key: Value, candidate: Record) {
        let replaced = lock(&self.pending).insert(key, candidate);
        self.stats.inserted.fetch_add(1, Ordering::Relaxed);
        if replaced.is_some() {
            self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
            trace!(table = %self.name, "coalesced pending candidate");
        }
        let _ = self.wakeup.0.try_send(());
    }

    /// Pending keys in first-arrival order
    pub(crate) fn pending_keys(&self) -> Vec<Value> {
        lock(&self.pending).keys().cloned().collect()
    }

    pub(crate) fn take_pending(&self, key: &Value) -> Option<Record> {
        lock(&self.pending).shift_remove(key)
    }

    pub(crate) fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub(crate) fn has_pending(&self) -> bool {
        !lock(&self.pending).is_empty()
    }

    pub(crate) fn wake(&self) {
        let _ = self.wakeup.0.try_send(());
    }

    pub(crate) fn wakeup(&self) -> &Receiver<()> {
        &self.wakeup.1
    }

    pub(crate) fn record_failure(&self, err: ProcessingError) {
        *lock(&self.last_failure) = Some(Arc::new(err));
    }

    pub(crate) fn snapshot(&self) -> Vec<(Value, Record)> {
        read(&self.state)
            .iter()
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect()
    }
}

impl Table {
    pub fn id(&self) -> TableId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.inner.schema
    }

    pub fn is_source(&self) -> bool {
        self.inner.is_root()
    }

    /// Validates `record` against this table's schema and buffers it as the
    /// pending candidate for its key. Only source tables accept inserts,
    /// derived tables are fed by their parents
    pub fn insert(&self, record: Record) -> EngineResult<()> {
        if !self.inner.is_root() {
            return Err(EngineError::NotASource(self.inner.name.to_string()));
        }
        let record = self.inner.schema.conform(record)?;
        self.inner.offer(record.key().clone(), record);
        Ok(())
    }

    /// The current materialized record for `key`, `None` if the key has never
    /// been materialized
    pub fn get(&self, key: &Value) -> Option<Record> {
        self.inner.get(key)
    }

    /// Iterates a snapshot of the table taken now, in key order. Writes after
    /// the call don't show up in the iterator
    pub fn scan(&self) -> Scan {
        Scan {
            rows: self.inner.snapshot().into_iter(),
        }
    }

    pub fn len(&self) -> usize {
        read(&self.inner.state).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys with an unconsumed candidate
    pub fn pending_len(&self) -> usize {
        self.inner.pending_len()
    }

    pub fn stats(&self) -> TableStats {
        self.inner.stats.snapshot()
    }

    /// The most recent update this table's operator failed on
    pub fn last_failure(&self) -> Option<Arc<ProcessingError>> {
        lock(&self.inner.last_failure).clone()
    }

    pub fn parents(&self) -> Vec<String> {
        self.inner
            .parents
            .iter()
            .filter_map(Weak::upgrade)
            .map(|parent| parent.name.to_string())
            .collect()
    }

    pub fn children(&self) -> Vec<String> {
        self.inner
            .children()
            .iter()
            .map(|child| child.name.to_string())
            .collect()
    }

    /// Derives a new table computed from this one by `operator`
    pub fn map<O: Operator>(
        &self,
        name: impl Into<String>,
        schema: Arc<Schema>,
        operator: O,
    ) -> EngineResult<Table> {
        self.graph
            .add_table(name.into(), schema, &[&self.inner], Some(Box::new(operator)))
    }

    /// Derives a new table from this table and `other`, joined by key. The
    /// operator only runs for keys both parents have materialized
    pub fn join<O: Operator>(
        &self,
        other: &Table,
        name: impl Into<String>,
        schema: Arc<Schema>,
        operator: O,
    ) -> EngineResult<Table> {
        self.graph.add_table(
            name.into(),
            schema,
            &[&self.inner, &other.inner],
            Some(Box::new(operator)),
        )
    }

    /// Replaces the admission policy of this table
    pub fn add_load_shedding<P: LoadShedding>(&self, policy: P) -> &Self {
        lock(&self.inner.task).shedding = Box::new(policy);
        self
    }

    /// Replaces the key selection policy of this table
    pub fn add_prioritization_policy<P: Prioritization>(&self, policy: P) -> &Self {
        lock(&self.inner.task).priority = Box::new(policy);
        self
    }

    /// Registers this table with the query boundary under `name`. Registering
    /// the same table under the same name again is a no-op
    pub fn mark_queryable(&self, name: impl Into<String>) -> EngineResult<&Self> {
        self.graph.register_queryable(name.into(), &self.inner)?;
        Ok(self)
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("schema", &self.inner.schema)
            .finish()
    }
}

impl Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Table")?;
        writeln!(f, "name: {} {}", self.inner.name, self.inner.id)?;
        writeln!(f, "schema: {}", self.inner.schema)?;
        writeln!(f, "parents: [{}]", self.parents().iter().join(", "))?;
        writeln!(f, "children: [{}]", self.children().iter().join(", "))?;
        writeln!(f, "size: {}", self.len())?;
        writeln!(f, "pending: {}", self.pending_len())
    }
}

/// A snapshot iterator over the `(key, record)` pairs of a table
pub struct Scan {
    rows: std::vec::IntoIter<(Value, Record)>,
}

impl Iterator for Scan {
    type Item = (Value, Record);

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.rows.size_hint()
    }
}

impl ExactSizeIterator for Scan {}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) inserted: AtomicU64,
    pub(crate) coalesced: AtomicU64,
    pub(crate) shed: AtomicU64,
    pub(crate) materialized: AtomicU64,
    pub(crate) declined: AtomicU64,
    pub(crate) gated: AtomicU64,
    pub(crate) failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> TableStats {
        TableStats {
            inserted: self.inserted.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            shed: self.shed.load(Ordering::Relaxed),
            materialized: self.materialized.load(Ordering::Relaxed),
            declined: self.declined.load(Ordering::Relaxed),
            gated: self.gated.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Counters describing what happened to the updates offered to a table
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    /// Candidates buffered, including ones later coalesced
    pub inserted: u64,
    /// Candidates that replaced an unconsumed candidate for the same key
    pub coalesced: u64,
    /// Candidates dropped by load shedding
    pub shed: u64,
    pub materialized: u64,
    /// Operator calls that produced no record
    pub declined: u64,
    /// Join updates skipped because a parent had no record for the key yet
    pub gated: u64,
    /// Operator calls that failed
    pub failed: u64,
}
