//! Scheduling
//!
//! A table is `IDLE` while it has no pending keys and `RUNNABLE` otherwise.
//! A single [step] moves a runnable table through `PROCESSING` for one key:
//! the prioritization policy picks the key, the load shedding policy admits
//! or drops its candidate, the operator computes the new record, and the
//! result is stored and offered to every child table
//!
//! The same step drives both the synchronous round robin passes of
//! [crate::Engine::run_once] and the per-table worker threads

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use tracing::{debug, error, trace, warn};

use crate::engine::Graph;
use crate::error::{BoxError, ProcessingError};
use crate::operator::{Context, Input};
use crate::table::{lock, TableInner};
use crate::{EngineError, EngineResult, Record, Value};

/// What a single [step] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// The table had no pending keys
    Idle,
    Processed(Outcome),
}

/// The fate of the update processed by a [step]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// A record was stored and offered to the children
    Materialized,
    /// The load shedding policy dropped the candidate
    Shed,
    /// The operator produced no record
    Declined,
    /// A join parent has no record for the key yet
    Gated,
    /// The operator failed, the update was dropped
    Failed,
}

/// Processes at most one pending key of `table`
///
/// Only fatal errors are returned. Failures of the operator are logged,
/// counted, and contained to the key they happened on
pub(crate) fn step(table: &TableInner) -> EngineResult<Step> {
    let pending = table.pending_keys();
    if pending.is_empty() {
        return Ok(Step::Idle);
    }

    let mut task = lock(&table.task);

    let key = task
        .priority
        .choose(&pending)
        .map_err(|_| EngineError::EmptyCandidateSet {
            table: table.name.to_string(),
        })?;

    if !pending.contains(&key) {
        return Err(EngineError::InvalidChoice {
            table: table.name.to_string(),
            key,
        });
    }

    let candidate = match table.take_pending(&key) {
        Some(candidate) => candidate,
        None => {
            return Err(EngineError::InvalidChoice {
                table: table.name.to_string(),
                key,
            })
        }
    };

    let current = table.get(&key);
    if !task.shedding.decide(&candidate, current.as_ref()) {
        table.stats.shed.fetch_add(1, Ordering::Relaxed);
        trace!(table = %table.name, %key, "candidate shed");
        return Ok(Step::Processed(Outcome::Shed));
    }

    let joined = match join_inputs(table, &key) {
        Some(joined) => joined,
        None => {
            table.stats.gated.fetch_add(1, Ordering::Relaxed);
            trace!(table = %table.name, %key, "join waiting on a parent");
            return Ok(Step::Processed(Outcome::Gated));
        }
    };

    let input = match &joined {
        Joined::Single => Input::Single(&candidate),
        Joined::Both(left, right) => Input::Joined { left, right },
    };

    let ctx = Context {
        table: &table.name,
        key: &key,
        schema: &table.schema,
    };

    let operator = &mut task.operator;
    let produced = panic::catch_unwind(AssertUnwindSafe(|| operator.process(input, &ctx)))
        .unwrap_or_else(|payload| Err(anyhow::anyhow!("operator panicked: {}", panic_message(&*payload))))
        .map_err(BoxError::from)
        .and_then(|output| match output {
            Some(record) => table.schema.conform(record).map(Some).map_err(BoxError::from),
            None => Ok(None),
        });

    let operator = task.operator.name();

    match produced {
        Ok(Some(record)) => {
            debug!(table = %table.name, operator, key = %record.key(), "materialized");
            publish(table, record);
            Ok(Step::Processed(Outcome::Materialized))
        }
        Ok(None) => {
            table.stats.declined.fetch_add(1, Ordering::Relaxed);
            trace!(table = %table.name, operator, %key, "operator declined to emit");
            Ok(Step::Processed(Outcome::Declined))
        }
        Err(source) => {
            let err = ProcessingError {
                table: table.name.to_string(),
                key,
                source,
            };
            table.stats.failed.fetch_add(1, Ordering::Relaxed);
            warn!(operator, error = %err, "dropping update");
            table.record_failure(err);
            Ok(Step::Processed(Outcome::Failed))
        }
    }
}

enum Joined {
    Single,
    Both(Record, Record),
}

/// Two-parent tables read the latest record of each parent for the key,
/// `None` until both have one
fn join_inputs(table: &TableInner, key: &Value) -> Option<Joined> {
    match table.parents.as_slice() {
        [left, right] => {
            let left = parent_record(left, key)?;
            let right = parent_record(right, key)?;
            Some(Joined::Both(left, right))
        }
        _ => Some(Joined::Single),
    }
}

fn parent_record(parent: &Weak<TableInner>, key: &Value) -> Option<Record> {
    parent.upgrade().and_then(|parent| parent.get(key))
}

/// Stores `record` and offers it to every child as a new candidate
fn publish(table: &TableInner, record: Record) {
    table.materialize(record.clone());
    for child in table.children() {
        child.offer(record.key().clone(), record.clone());
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("unknown panic payload")
    }
}

/// One round robin pass: every table, in declaration order, processes at
/// most one key. Returns how many tables did work
pub(crate) fn pass(tables: &[Arc<TableInner>]) -> EngineResult<usize> {
    let mut processed = 0;
    for table in tables {
        if let Step::Processed(_) = step(table)? {
            processed += 1;
        }
    }
    Ok(processed)
}

/// Body of a table's worker thread. Runs until the engine stops or the
/// table hits a fatal error
pub(crate) fn work(table: Arc<TableInner>, graph: Arc<Graph>) {
    debug!(table = %table.name, "worker started");
    while !graph.is_stopping() {
        match step(&table) {
            Ok(Step::Idle) => {
                let _ = table.wakeup().recv_timeout(graph.config.idle_wait);
            }
            Ok(Step::Processed(_)) => {}
            Err(err) => {
                error!(table = %table.name, error = %err, "worker stopped");
                graph.fail(err);
                break;
            }
        }
    }
    debug!(table = %table.name, "worker finished");
}
