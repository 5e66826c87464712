//! Sources
//!
//! Anything that calls [crate::Table::insert] on a source table feeds the
//! engine. A [Source] attached through [crate::Engine::create_source_with]
//! is polled by the engine instead, on a feeder thread of its own while the
//! engine runs, or once per pass by the synchronous drivers

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::engine::Graph;
use crate::table::TableInner;
use crate::{EngineError, Record};

/// The result of polling a [Source]
#[derive(Debug)]
pub enum SourcePoll {
    /// New records for the source table, in arrival order
    Records(Vec<Record>),
    /// Nothing new right now, poll again later
    Idle,
    /// The source will never produce another record
    Exhausted,
}

/// A pull-based feeder for a source table
///
/// The source alone controls its arrival rate, the engine never blocks it
pub trait Source: Send + 'static {
    fn poll(&mut self) -> anyhow::Result<SourcePoll>;
}

impl<F> Source for F
where
    F: FnMut() -> anyhow::Result<SourcePoll> + Send + 'static,
{
    fn poll(&mut self) -> anyhow::Result<SourcePoll> {
        self()
    }
}

/// Feeds records from an iterator, `batch` at a time
pub struct IterSource<I> {
    iter: I,
    batch: usize,
}

impl<I> IterSource<I>
where
    I: Iterator<Item = Record> + Send + 'static,
{
    pub fn new(iter: impl IntoIterator<IntoIter = I>, batch: usize) -> Self {
        Self {
            iter: iter.into_iter(),
            batch: batch.max(1),
        }
    }
}

impl<I> Source for IterSource<I>
where
    I: Iterator<Item = Record> + Send + 'static,
{
    fn poll(&mut self) -> anyhow::Result<SourcePoll> {
        let records: Vec<Record> = self.iter.by_ref().take(self.batch).collect();
        if records.is_empty() {
            Ok(SourcePoll::Exhausted)
        } else {
            Ok(SourcePoll::Records(records))
        }
    }
}

/// A source attached to a table of the graph
pub(crate) struct Feed {
    pub(crate) table: Arc<TableInner>,
    pub(crate) source: Option<Box<dyn Source>>,
    pub(crate) exhausted: bool,
}

/// What polling a feed once did
pub(crate) enum Fed {
    Records(usize),
    Idle,
    Exhausted,
}

/// Polls `source` once and inserts whatever it produced. Records the table
/// rejects are logged and skipped
pub(crate) fn poll_once(table: &TableInner, source: &mut dyn Source) -> Result<Fed, EngineError> {
    match source.poll() {
        Ok(SourcePoll::Records(records)) => {
            let mut delivered = 0;
            for record in records {
                match table.schema.conform(record) {
                    Ok(record) => {
                        table.offer(record.key().clone(), record);
                        delivered += 1;
                    }
                    Err(violation) => {
                        warn!(table = %table.name, error = %violation, "source record rejected");
                    }
                }
            }
            Ok(Fed::Records(delivered))
        }
        Ok(SourcePoll::Idle) => Ok(Fed::Idle),
        Ok(SourcePoll::Exhausted) => Ok(Fed::Exhausted),
        Err(err) => Err(EngineError::Source {
            table: table.name.to_string(),
            source: err.into(),
        }),
    }
}

/// Body of a feeder thread. Hands the source back when the engine stops, with
/// whether it was exhausted
pub(crate) fn feed(
    table: Arc<TableInner>,
    mut source: Box<dyn Source>,
    graph: Arc<Graph>,
) -> (Box<dyn Source>, bool) {
    debug!(table = %table.name, "feeder started");
    let interval: Duration = graph.config.source_poll_interval;
    while !graph.is_stopping() {
        match poll_once(&table, source.as_mut()) {
            Ok(Fed::Records(_)) => {}
            Ok(Fed::Idle) => std::thread::sleep(interval),
            Ok(Fed::Exhausted) => {
                debug!(table = %table.name, "source exhausted");
                return (source, true);
            }
            Err(err) => {
                warn!(error = %err, "feeder stopped");
                graph.fail(err);
                return (source, true);
            }
        }
    }
    (source, false)
}
