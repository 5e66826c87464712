use std::fmt::{self, Display};
use std::sync::Arc;

use indexmap::IndexMap;
use itertools::Itertools;

use crate::error::SchemaViolation;
use crate::{Record, Value, ValueType};

/// [Schema]
///
/// Declares the primary key and the ordered, uniquely named columns every
/// [Record] of a table carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    primary_key: Arc<str>,
    columns: IndexMap<Arc<str>, ValueType>,
    key_index: usize,
}

impl Schema {
    /// Builds a schema from its primary key and `(name, type)` column pairs,
    /// in declaration order
    pub fn new<K, I, N>(primary_key: K, columns: I) -> Result<Arc<Self>, SchemaViolation>
    where
        K: AsRef<str>,
        I: IntoIterator<Item = (N, ValueType)>,
        N: AsRef<str>,
    {
        let mut map = IndexMap::new();
        for (name, ty) in columns {
            let name: Arc<str> = Arc::from(name.as_ref());
            if map.insert(name.clone(), ty).is_some() {
                return Err(SchemaViolation::DuplicateColumn(name.to_string()));
            }
        }

        let key_index = map
            .get_index_of(primary_key.as_ref())
            .ok_or_else(|| SchemaViolation::MissingPrimaryKey(primary_key.as_ref().to_string()))?;

        let primary_key = map
            .get_index(key_index)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| SchemaViolation::MissingPrimaryKey(primary_key.as_ref().to_string()))?;

        Ok(Arc::new(Schema {
            primary_key,
            columns: map,
            key_index,
        }))
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    /// Position of the primary key among the columns
    pub fn key_index(&self) -> usize {
        self.key_index
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.get_index_of(name)
    }

    pub fn column_type(&self, name: &str) -> Option<ValueType> {
        self.columns.get(name).copied()
    }

    /// Iterates `(name, type)` in declaration order
    pub fn columns(&self) -> impl Iterator<Item = (&str, ValueType)> {
        self.columns.iter().map(|(name, ty)| (name.as_ref(), *ty))
    }

    /// Builds a [Record] conforming to this schema from named values, in any order
    pub fn record<I, N, V>(self: &Arc<Self>, fields: I) -> Result<Record, SchemaViolation>
    where
        I: IntoIterator<Item = (N, V)>,
        N: AsRef<str>,
        V: Into<Value>,
    {
        let mut slots: Vec<Option<Value>> = vec![None; self.columns.len()];
        for (name, value) in fields {
            let name = name.as_ref();
            let (index, _, ty) = self
                .columns
                .get_full(name)
                .ok_or_else(|| SchemaViolation::UnknownField(name.to_string()))?;
            slots[index] = Some(Self::check(name, *ty, value.into())?);
        }
        self.fill(slots)
    }

    /// Checks `record` against this schema by field name, returning a record
    /// that shares this schema. Records built against an equal schema pass
    /// straight through
    pub fn conform(self: &Arc<Self>, record: Record) -> Result<Record, SchemaViolation> {
        if Arc::ptr_eq(self, record.schema()) {
            return Ok(record);
        }
        if self.as_ref() == record.schema().as_ref() {
            return Ok(record.reseat(self.clone()));
        }
        self.record(record.iter().map(|(name, value)| (name, value.clone())))
    }

    fn check(name: &str, ty: ValueType, value: Value) -> Result<Value, SchemaViolation> {
        let found = value.value_type();
        value.coerce(ty).ok_or_else(|| SchemaViolation::TypeMismatch {
            field: name.to_string(),
            expected: ty,
            found,
        })
    }

    fn fill(self: &Arc<Self>, slots: Vec<Option<Value>>) -> Result<Record, SchemaViolation> {
        let values = slots
            .into_iter()
            .zip(self.columns.keys())
            .map(|(slot, name)| slot.ok_or_else(|| SchemaViolation::MissingField(name.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Record::from_parts(self.clone(), values))
    }
}

impl Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let columns = self
            .columns
            .iter()
            .map(|(name, ty)| {
                if name.as_ref() == self.primary_key.as_ref() {
                    format!("*{}: {}", name, ty)
                } else {
                    format!("{}: {}", name, ty)
                }
            })
            .join(", ");
        write!(f, "{{{}}}", columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn ratings() -> Arc<Schema> {
        Schema::new("user", [("user", ValueType::Str), ("rating", ValueType::Float)]).unwrap()
    }

    #[test]
    fn primary_key_must_be_declared() {
        let err = Schema::new("id", [("user", ValueType::Str)]).unwrap_err();
        assert_eq!(err, SchemaViolation::MissingPrimaryKey("id".into()));
    }

    #[test]
    fn duplicate_columns_are_rejected() {
        let err = Schema::new("a", [("a", ValueType::Int), ("a", ValueType::Str)]).unwrap_err();
        assert_eq!(err, SchemaViolation::DuplicateColumn("a".into()));
    }

    #[test]
    fn records_are_validated() {
        let schema = ratings();
        assert_matches!(
            schema.record([("user", Value::from("1"))]),
            Err(SchemaViolation::MissingField(f)) if f == "rating"
        );
        assert_matches!(
            schema.record([("user", Value::from("1")), ("rating", Value::from("five"))]),
            Err(SchemaViolation::TypeMismatch { expected: ValueType::Float, found: ValueType::Str, .. })
        );
        assert_matches!(
            schema.record([("user", Value::from("1")), ("rating", Value::from(3)), ("movie", Value::from(1))]),
            Err(SchemaViolation::UnknownField(f)) if f == "movie"
        );

        let record = schema.record([("rating", Value::from(3)), ("user", Value::from("1"))]).unwrap();
        assert_eq!(record.key(), &Value::from("1"));
        assert_eq!(record.get("rating"), Some(&Value::from(3.0)));
    }

    #[test]
    fn conform_by_name() {
        let other = Schema::new("user", [("rating", ValueType::Float), ("user", ValueType::Str)]).unwrap();
        let record = other.record([("user", "7"), ("rating", "x")]);
        assert!(record.is_err());

        let record = other
            .record([("user", Value::from("7")), ("rating", Value::from(1.5))])
            .unwrap();
        let schema = ratings();
        let conformed = schema.conform(record).unwrap();
        assert!(Arc::ptr_eq(conformed.schema(), &schema));
        assert_eq!(conformed.values()[1], Value::from(1.5));
    }

    #[test]
    fn display() {
        assert_eq!(ratings().to_string(), "{*user: str, rating: float}");
    }
}
