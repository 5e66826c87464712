use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::SchemaViolation;
use crate::operator::Operator;
use crate::query::QueryServer;
use crate::scheduler;
use crate::source::{self, Fed, Feed, Source};
use crate::table::{lock, read, write, TableInner};
use crate::{EngineConfig, EngineError, EngineResult, Schema, Table};

/// The engine itself. This is the interface for consuming code
///
/// An [Engine] owns the table graph, the worker threads that keep it up to
/// date, and the registry of queryable tables. Tables are declared with
/// [Engine::create_source] and derived with [Table::map] / [Table::join],
/// then the graph is either driven on the calling thread with
/// [Engine::run_once] / [Engine::run_until_idle], or by one worker thread per
/// table between [Engine::start] and [Engine::stop]
pub struct Engine {
    graph: Arc<Graph>,
    workers: Vec<(String, JoinHandle<()>)>,
    feeders: Vec<(usize, JoinHandle<(Box<dyn Source>, bool)>)>,
}

/// State shared between the engine, its table handles, and its threads
pub(crate) struct Graph {
    pub(crate) config: EngineConfig,

    /// Every table in declaration order, parents always precede children
    tables: RwLock<Vec<Arc<TableInner>>>,

    /// Tables registered with the query boundary
    catalog: DashMap<String, Arc<TableInner>>,

    feeds: Mutex<Vec<Feed>>,
    running: AtomicBool,
    stopping: AtomicBool,

    /// First error that stopped a worker or feeder
    fatal: Mutex<Option<EngineError>>,
}

impl Graph {
    fn new(config: EngineConfig) -> Self {
        Self {
            config,
            tables: RwLock::new(Vec::new()),
            catalog: DashMap::new(),
            feeds: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            fatal: Mutex::new(None),
        }
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Keeps the first failure, later ones are usually fallout
    pub(crate) fn fail(&self, err: EngineError) {
        let mut fatal = lock(&self.fatal);
        if fatal.is_none() {
            *fatal = Some(err);
        }
    }

    pub(crate) fn add_table(
        self: &Arc<Self>,
        name: String,
        schema: Arc<Schema>,
        parents: &[&Arc<TableInner>],
        operator: Option<Box<dyn Operator>>,
    ) -> EngineResult<Table> {
        // `start` flips `running` under this lock
        let mut tables = write(&self.tables);
        if self.is_running() {
            return Err(EngineError::EngineRunning);
        }
        if tables.iter().any(|table| &*table.name == name.as_str()) {
            return Err(EngineError::DuplicateName(name));
        }
        for parent in parents {
            if !tables.iter().any(|table| Arc::ptr_eq(table, parent)) {
                return Err(EngineError::UnknownTable(parent.name.to_string()));
            }
        }
        if let [left, right] = parents {
            check_join_keys(left, right)?;
        }

        let inner = Arc::new(TableInner::new(Arc::from(name), schema, parents, operator));
        for parent in parents {
            parent.add_child(inner.clone());
        }
        tables.push(inner.clone());

        debug!(
            table = %inner.name,
            id = %inner.id,
            schema = %inner.schema,
            parents = parents.len(),
            "table declared"
        );

        Ok(Table {
            inner,
            graph: self.clone(),
        })
    }

    pub(crate) fn register_queryable(&self, name: String, table: &Arc<TableInner>) -> EngineResult<()> {
        match self.catalog.entry(name) {
            Entry::Occupied(entry) if Arc::ptr_eq(entry.get(), table) => Ok(()),
            Entry::Occupied(entry) => Err(EngineError::DuplicateName(entry.key().clone())),
            Entry::Vacant(entry) => {
                debug!(table = %table.name, name = %entry.key(), "table marked queryable");
                entry.insert(table.clone());
                Ok(())
            }
        }
    }

    pub(crate) fn queryable(&self, name: &str) -> EngineResult<Arc<TableInner>> {
        self.catalog
            .get(name)
            .map(|table| table.value().clone())
            .ok_or_else(|| EngineError::UnknownTable(name.to_string()))
    }

    pub(crate) fn queryable_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.catalog.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    fn tables(&self) -> Vec<Arc<TableInner>> {
        read(&self.tables).clone()
    }
}

/// Both sides of a join are matched by key, so their keys must share a type
fn check_join_keys(left: &TableInner, right: &TableInner) -> Result<(), SchemaViolation> {
    let left_key = left.schema.column_type(left.schema.primary_key());
    let right_key = right.schema.column_type(right.schema.primary_key());
    match (left_key, right_key) {
        (Some(expected), Some(found)) if expected != found => Err(SchemaViolation::TypeMismatch {
            field: right.schema.primary_key().to_string(),
            expected,
            found,
        }),
        _ => Ok(()),
    }
}

impl Engine {
    /// Creates a new [Engine] with the default [EngineConfig]
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            graph: Arc::new(Graph::new(config)),
            workers: Vec::new(),
            feeders: Vec::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.graph.config
    }

    /// Declares a source table, fed by whoever calls [Table::insert] on it
    pub fn create_source(&self, name: impl Into<String>, schema: Arc<Schema>) -> EngineResult<Table> {
        self.graph.add_table(name.into(), schema, &[], None)
    }

    /// Declares a source table fed by `source`, which the engine polls
    pub fn create_source_with<S: Source>(
        &self,
        name: impl Into<String>,
        schema: Arc<Schema>,
        source: S,
    ) -> EngineResult<Table> {
        let table = self.create_source(name, schema)?;
        lock(&self.graph.feeds).push(Feed {
            table: table.inner.clone(),
            source: Some(Box::new(source)),
            exhausted: false,
        });
        Ok(table)
    }

    /// Looks up any table of the graph by name, queryable or not
    pub fn table(&self, name: &str) -> Option<Table> {
        read(&self.graph.tables)
            .iter()
            .find(|table| &*table.name == name)
            .map(|inner| Table {
                inner: inner.clone(),
                graph: self.graph.clone(),
            })
    }

    /// Every table in declaration order
    pub fn tables(&self) -> Vec<Table> {
        self.graph
            .tables()
            .into_iter()
            .map(|inner| Table {
                inner,
                graph: self.graph.clone(),
            })
            .collect()
    }

    /// The read side of the engine, serving the tables marked queryable
    pub fn query_server(&self) -> QueryServer {
        QueryServer::new(self.graph.clone())
    }

    pub fn is_running(&self) -> bool {
        self.graph.is_running()
    }

    /// Whether any table has unconsumed candidates
    pub fn has_pending(&self) -> bool {
        self.graph.tables().iter().any(|table| table.has_pending())
    }

    /// Polls every attached source once, then makes one round robin pass
    /// over the tables in declaration order, each processing at most one key.
    /// Returns the number of tables that processed a key
    pub fn run_once(&mut self) -> EngineResult<usize> {
        if self.is_running() {
            return Err(EngineError::EngineRunning);
        }
        self.poll_sources()?;
        scheduler::pass(&self.graph.tables())
    }

    /// Repeats [Engine::run_once] until the sources have nothing new and no
    /// table has pending work. Returns the number of keys processed
    pub fn run_until_idle(&mut self) -> EngineResult<usize> {
        if self.is_running() {
            return Err(EngineError::EngineRunning);
        }

        let tables = self.graph.tables();
        let mut total = 0;
        let mut passes = 0;
        loop {
            let fed = self.poll_sources()?;
            let processed = scheduler::pass(&tables)?;
            total += processed;
            passes += 1;

            if processed == 0 && fed == 0 {
                break;
            }
            if self.graph.config.max_passes.is_some_and(|max| passes >= max) {
                debug!(passes, "stopping at the pass limit");
                break;
            }
        }
        Ok(total)
    }

    /// Polls each attached, unexhausted source once on this thread
    fn poll_sources(&self) -> EngineResult<usize> {
        let mut feeds = lock(&self.graph.feeds);
        let mut fed = 0;
        for feed in feeds.iter_mut().filter(|feed| !feed.exhausted) {
            let Some(source) = feed.source.as_mut() else {
                continue;
            };
            match source::poll_once(&feed.table, source.as_mut()) {
                Ok(Fed::Records(count)) => fed += count,
                Ok(Fed::Idle) => {}
                Ok(Fed::Exhausted) => feed.exhausted = true,
                Err(err) => {
                    feed.exhausted = true;
                    return Err(err);
                }
            }
        }
        Ok(fed)
    }

    /// Starts one worker thread per table and one feeder thread per attached
    /// source. The graph can't change until [Engine::stop]
    pub fn start(&mut self) -> EngineResult<()> {
        let tables = {
            let tables = write(&self.graph.tables);
            if self.graph.running.swap(true, Ordering::SeqCst) {
                return Err(EngineError::EngineRunning);
            }
            tables.clone()
        };
        self.graph.stopping.store(false, Ordering::SeqCst);
        *lock(&self.graph.fatal) = None;

        let prefix = self.graph.config.thread_name_prefix.clone();
        let mut spawn_error = None;

        for table in tables.iter() {
            let name = table.name.to_string();
            let (worker_table, graph) = (table.clone(), self.graph.clone());
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", prefix, name))
                .spawn(move || scheduler::work(worker_table, graph));
            match spawned {
                Ok(handle) => self.workers.push((name, handle)),
                Err(err) => {
                    spawn_error = Some(err);
                    break;
                }
            }
        }

        if spawn_error.is_none() {
            let mut feeds = lock(&self.graph.feeds);
            for (index, feed) in feeds.iter_mut().enumerate() {
                if feed.exhausted {
                    continue;
                }
                let Some(source) = feed.source.take() else {
                    continue;
                };
                let (feed_table, graph) = (feed.table.clone(), self.graph.clone());
                let spawned = thread::Builder::new()
                    .name(format!("{}-{}-source", prefix, feed.table.name))
                    .spawn(move || source::feed(feed_table, source, graph));
                match spawned {
                    Ok(handle) => self.feeders.push((index, handle)),
                    Err(err) => {
                        feed.exhausted = true;
                        spawn_error = Some(err);
                        break;
                    }
                }
            }
        }

        if let Some(err) = spawn_error {
            let _ = self.stop();
            return Err(EngineError::Spawn(err));
        }

        info!(
            tables = tables.len(),
            sources = self.feeders.len(),
            "engine started"
        );
        Ok(())
    }

    /// Stops and joins every worker and feeder. Returns the first error that
    /// stopped a worker or feeder while the engine ran, if any
    pub fn stop(&mut self) -> EngineResult<()> {
        if !self.is_running() {
            return Ok(());
        }

        self.graph.stopping.store(true, Ordering::SeqCst);
        for table in self.graph.tables() {
            table.wake();
        }

        for (name, handle) in self.workers.drain(..) {
            if handle.join().is_err() {
                self.graph.fail(EngineError::WorkerPanicked(name));
            }
        }

        let mut feeds = lock(&self.graph.feeds);
        for (index, handle) in self.feeders.drain(..) {
            match handle.join() {
                Ok((source, exhausted)) => {
                    if let Some(feed) = feeds.get_mut(index) {
                        feed.source = Some(source);
                        feed.exhausted = exhausted;
                    }
                }
                Err(_) => {
                    if let Some(feed) = feeds.get_mut(index) {
                        feed.exhausted = true;
                        self.graph.fail(EngineError::WorkerPanicked(format!("{}-source", feed.table.name)));
                    }
                }
            }
        }
        drop(feeds);

        self.graph.running.store(false, Ordering::SeqCst);
        self.graph.stopping.store(false, Ordering::SeqCst);
        info!("engine stopped");

        match lock(&self.graph.fatal).take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{step, Outcome, Step};
    use crate::policy::EmptyCandidateSet;
    use crate::{operator, schema, Record, Value};
    use assert_matches::assert_matches;

    #[test]
    fn graph_rejects_duplicate_names() {
        let engine = Engine::new();
        let schema = schema!(id: Int).unwrap();
        let source = engine.create_source("numbers", schema.clone()).unwrap();
        assert_matches!(
            engine.create_source("numbers", schema.clone()),
            Err(EngineError::DuplicateName(name)) if name == "numbers"
        );
        assert_matches!(
            source.map("numbers", schema, operator::Identity),
            Err(EngineError::DuplicateName(_))
        );
    }

    #[test]
    fn join_keys_must_share_a_type() {
        let engine = Engine::new();
        let users = engine.create_source("users", schema!(user: Str).unwrap()).unwrap();
        let ids = engine.create_source("ids", schema!(id: Int).unwrap()).unwrap();
        assert_matches!(
            users.join(&ids, "joined", schema!(user: Str).unwrap(), operator::Identity),
            Err(EngineError::SchemaViolation(SchemaViolation::TypeMismatch { .. }))
        );
    }

    #[test]
    fn step_outcomes() {
        let engine = Engine::new();
        let schema = schema!(id: Int, n: Int).unwrap();
        let source = engine.create_source("numbers", schema.clone()).unwrap();
        let evens = source
            .map(
                "evens",
                schema.clone(),
                operator::from_fn(|input, _| -> anyhow::Result<Option<Record>> {
                    let n = input.record().get("n").and_then(Value::as_i64).unwrap_or(0);
                    if n < 0 {
                        anyhow::bail!("negative");
                    }
                    Ok((n % 2 == 0).then(|| input.record().clone()))
                }),
            )
            .unwrap();

        assert_eq!(step(&source.inner).unwrap(), Step::Idle);

        for (id, n) in [(1, 2), (2, 3), (3, -1)] {
            source.insert(schema.record([("id", id), ("n", n)]).unwrap()).unwrap();
        }
        for _ in 0..3 {
            assert_eq!(step(&source.inner).unwrap(), Step::Processed(Outcome::Materialized));
        }

        let outcomes: Vec<Step> = (0..3).map(|_| step(&evens.inner).unwrap()).collect();
        assert_eq!(
            outcomes,
            vec![
                Step::Processed(Outcome::Materialized),
                Step::Processed(Outcome::Declined),
                Step::Processed(Outcome::Failed),
            ]
        );
        assert_eq!(step(&evens.inner).unwrap(), Step::Idle);
    }

    #[test]
    fn invalid_choice_is_fatal() {
        let engine = Engine::new();
        let schema = schema!(id: Int).unwrap();
        let source = engine.create_source("numbers", schema.clone()).unwrap();
        source.add_prioritization_policy(|_: &[Value]| -> Result<Value, EmptyCandidateSet> {
            Ok(Value::from(99))
        });
        source.insert(schema.record([("id", 1)]).unwrap()).unwrap();

        let err = step(&source.inner).unwrap_err();
        assert!(err.is_fatal());
        assert_matches!(err, EngineError::InvalidChoice { key, .. } if key == Value::from(99));
    }
}
