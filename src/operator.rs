//! Operators
//!
//! An [Operator] computes the records of a derived table from the records
//! of its parents, one key at a time

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context as _;

use crate::{Record, Schema, Value};

/// What an [Operator] is handed for a single key
#[derive(Debug, Clone, Copy)]
pub enum Input<'a> {
    /// The candidate record materialized by the single parent
    Single(&'a Record),

    /// The latest record of each parent of a two-parent table, for the same key
    Joined { left: &'a Record, right: &'a Record },
}

impl<'a> Input<'a> {
    /// The single parent record, or the left side of a join
    pub fn record(&self) -> &'a Record {
        match self {
            Input::Single(record) => record,
            Input::Joined { left, .. } => left,
        }
    }

    pub fn right(&self) -> Option<&'a Record> {
        match self {
            Input::Single(_) => None,
            Input::Joined { right, .. } => Some(right),
        }
    }
}

/// Information about the table an [Operator] is producing records for
pub struct Context<'a> {
    pub(crate) table: &'a str,
    pub(crate) key: &'a Value,
    pub(crate) schema: &'a Arc<Schema>,
}

impl<'a> Context<'a> {
    pub fn table(&self) -> &'a str {
        self.table
    }

    /// The pending key this invocation was scheduled for
    pub fn key(&self) -> &'a Value {
        self.key
    }

    /// Schema of the records this operator must produce
    pub fn schema(&self) -> &'a Arc<Schema> {
        self.schema
    }
}

/// A per-table transform
///
/// Operators are owned by exactly one table and only ever called by whichever
/// thread is processing that table, so they are free to keep private mutable
/// state. Returning `Ok(None)` declines to emit a record and ends propagation
/// for this update. Returning an error drops the update
pub trait Operator: Send + 'static {
    fn process(&mut self, input: Input<'_>, ctx: &Context<'_>) -> anyhow::Result<Option<Record>>;

    /// Name used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl<F> Operator for F
where
    F: FnMut(Input<'_>, &Context<'_>) -> anyhow::Result<Option<Record>> + Send + 'static,
{
    fn process(&mut self, input: Input<'_>, ctx: &Context<'_>) -> anyhow::Result<Option<Record>> {
        self(input, ctx)
    }
}

/// Wraps a closure as an [Operator], letting the compiler infer the closure's
/// argument types
pub fn from_fn<F>(f: F) -> FnOperator<F>
where
    F: FnMut(Input<'_>, &Context<'_>) -> anyhow::Result<Option<Record>> + Send + 'static,
{
    FnOperator(f)
}

pub struct FnOperator<F>(F);

impl<F> Operator for FnOperator<F>
where
    F: FnMut(Input<'_>, &Context<'_>) -> anyhow::Result<Option<Record>> + Send + 'static,
{
    fn process(&mut self, input: Input<'_>, ctx: &Context<'_>) -> anyhow::Result<Option<Record>> {
        (self.0)(input, ctx)
    }
}

/// Root tables materialize their candidates as they are
pub(crate) struct Passthrough;

impl Operator for Passthrough {
    fn process(&mut self, input: Input<'_>, _: &Context<'_>) -> anyhow::Result<Option<Record>> {
        Ok(Some(input.record().clone()))
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}

/// Re-emits the parent record under the child table's schema. Fields are
/// matched by name, so the child may declare them in a different order
#[derive(Debug, Default)]
pub struct Identity;

impl Operator for Identity {
    fn process(&mut self, input: Input<'_>, ctx: &Context<'_>) -> anyhow::Result<Option<Record>> {
        let record = ctx.schema().conform(input.record().clone())?;
        Ok(Some(record))
    }

    fn name(&self) -> &str {
        "identity"
    }
}

/// Keeps a running mean of a numeric field per key
///
/// The output record holds the parent key under the child's primary key and
/// the mean under `output`. Every observed candidate contributes once
#[derive(Debug)]
pub struct RunningAverage {
    field: String,
    output: String,
    totals: HashMap<Value, (f64, u64)>,
}

impl RunningAverage {
    pub fn new(field: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            output: output.into(),
            totals: HashMap::new(),
        }
    }

    /// Number of observations folded in for `key` so far
    pub fn observations(&self, key: &Value) -> u64 {
        self.totals.get(key).map(|(_, n)| *n).unwrap_or(0)
    }
}

impl Operator for RunningAverage {
    fn process(&mut self, input: Input<'_>, ctx: &Context<'_>) -> anyhow::Result<Option<Record>> {
        let record = input.record();
        let sample = record
            .get(&self.field)
            .and_then(Value::as_f64)
            .with_context(|| format!("field {} is missing or not numeric", self.field))?;

        let (sum, count) = self.totals.entry(record.key().clone()).or_insert((0.0, 0));
        *sum += sample;
        *count += 1;
        let mean = *sum / *count as f64;

        let schema = ctx.schema();
        let out = schema.record([
            (schema.primary_key(), record.key().clone()),
            (self.output.as_str(), Value::from(mean)),
        ])?;
        Ok(Some(out))
    }

    fn name(&self) -> &str {
        "running_average"
    }
}
