//! Queries
//!
//! The read side of an [crate::Engine]. A [QueryServer] serves point and bulk
//! reads over the current state of every table marked queryable, straight
//! from the tables and without waiting on the scheduler. The transport
//! between a client and a server is left to the embedding program, anything
//! that implements [QueryClient] can stand in front of a server

use std::sync::Arc;

use tracing::trace;

use crate::engine::Graph;
use crate::{EngineError, EngineResult, Record, Value};

/// Serves the tables registered with [crate::Table::mark_queryable]
#[derive(Clone)]
pub struct QueryServer {
    graph: Arc<Graph>,
}

impl QueryServer {
    pub(crate) fn new(graph: Arc<Graph>) -> Self {
        Self { graph }
    }

    /// The current record for `key` in the table registered as `table`
    pub fn point_query(&self, table: &str, key: &Value) -> EngineResult<Record> {
        let inner = self.graph.queryable(table)?;
        trace!(table, %key, "point query");
        inner.get(key).ok_or_else(|| EngineError::KeyNotFound {
            table: table.to_string(),
            key: key.clone(),
        })
    }

    /// A consistent snapshot of every record in the table registered as
    /// `table`, in key order
    pub fn bulk_query(&self, table: &str) -> EngineResult<Vec<Record>> {
        let inner = self.graph.queryable(table)?;
        trace!(table, "bulk query");
        Ok(inner.snapshot().into_iter().map(|(_, record)| record).collect())
    }

    /// Names of the queryable tables, sorted
    pub fn tables(&self) -> Vec<String> {
        self.graph.queryable_names()
    }
}

/// The client side of the query boundary
pub trait QueryClient {
    fn point_query(&self, table: &str, key: &Value) -> EngineResult<Record>;
    fn bulk_query(&self, table: &str) -> EngineResult<Vec<Record>>;
}

/// A client living in the same process as its server
#[derive(Clone)]
pub struct LocalClient {
    server: QueryServer,
}

impl LocalClient {
    pub fn new(server: QueryServer) -> Self {
        Self { server }
    }
}

impl QueryClient for LocalClient {
    fn point_query(&self, table: &str, key: &Value) -> EngineResult<Record> {
        self.server.point_query(table, key)
    }

    fn bulk_query(&self, table: &str) -> EngineResult<Vec<Record>> {
        self.server.bulk_query(table)
    }
}
