//!
//! Ralf is an incremental feature-computation engine: a graph of tables kept up to date
//! per key as new records arrive, with pluggable load shedding and key prioritization
//!

#[macro_use]
mod macros;
pub mod config;
pub mod error;
pub mod id;
pub mod operator;
pub mod policy;
pub mod query;
pub mod record;
pub mod schema;
pub mod source;
pub mod table;
pub mod value;

pub(crate) mod engine;
pub(crate) mod scheduler;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, EngineResult, ProcessingError, SchemaViolation};
pub use id::TableId;
pub use operator::{Context, Input, Operator};
pub use policy::{LoadShedding, Prioritization};
pub use query::{LocalClient, QueryClient, QueryServer};
pub use record::Record;
pub use schema::Schema;
pub use source::{IterSource, Source, SourcePoll};
pub use table::{Scan, Table, TableStats};
pub use value::{Value, ValueType};
