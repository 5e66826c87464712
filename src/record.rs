use std::fmt::{self, Display};
use std::sync::Arc;

use itertools::Itertools;
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::error::SchemaViolation;
use crate::{Schema, Value};

/// [Record]
///
/// An immutable keyed tuple of values, stored in the column order of its
/// [Schema]. Cloning a record is cheap, the values are shared
#[derive(Debug, Clone)]
pub struct Record {
    schema: Arc<Schema>,
    values: Arc<[Value]>,
}

impl Record {
    /// Callers guarantee `values` conforms to `schema`
    pub(crate) fn from_parts(schema: Arc<Schema>, values: Vec<Value>) -> Self {
        debug_assert_eq!(schema.len(), values.len());
        Record {
            schema,
            values: values.into(),
        }
    }

    pub(crate) fn reseat(self, schema: Arc<Schema>) -> Self {
        debug_assert_eq!(self.schema.as_ref(), schema.as_ref());
        Record {
            schema,
            values: self.values,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// The primary key value of this record
    pub fn key(&self) -> &Value {
        &self.values[self.schema.key_index()]
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.schema.index_of(field).map(|index| &self.values[index])
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Iterates `(field, value)` pairs in column order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.schema.columns().map(|(name, _)| name).zip(self.values.iter())
    }

    /// Returns a new record with `field` replaced, the original is left untouched
    pub fn with(&self, field: &str, value: impl Into<Value>) -> Result<Record, SchemaViolation> {
        let index = self
            .schema
            .index_of(field)
            .ok_or_else(|| SchemaViolation::UnknownField(field.to_string()))?;
        let ty = self
            .schema
            .column_type(field)
            .ok_or_else(|| SchemaViolation::UnknownField(field.to_string()))?;

        let value = value.into();
        let found = value.value_type();
        let value = value.coerce(ty).ok_or_else(|| SchemaViolation::TypeMismatch {
            field: field.to_string(),
            expected: ty,
            found,
        })?;

        let mut values = self.values.to_vec();
        values[index] = value;
        Ok(Record::from_parts(self.schema.clone(), values))
    }
}

/// Records compare by their fields, two records built against different but
/// equal schemas are equal
impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
            && (Arc::ptr_eq(&self.schema, &other.schema) || self.schema == other.schema)
    }
}

impl Eq for Record {}

impl Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = self
            .iter()
            .map(|(name, value)| format!("{}: {}", name, value))
            .join(", ");
        write!(f, "{{{}}}", fields)
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in self.iter() {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}
