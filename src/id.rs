use std::fmt::{self, Debug, Display};

/// A `TableId` identifies a single table within an [crate::Engine]
///
/// Table id's are simply an FNV-1a hash of the table name, names are unique
/// per engine so they are stable across runs of the same graph
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableId(u64);

impl TableId {
    pub const fn of(name: &str) -> Self {
        TableId(const_fnv1a_hash::fnv1a_hash_str_64(name))
    }

    pub fn raw_id(&self) -> u64 {
        self.0
    }
}

impl Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T[{:016x}]", self.0)
    }
}

impl Debug for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

#[test]
fn test_table_id() {
    const RATINGS: TableId = TableId::of("ratings");
    assert_eq!(RATINGS, TableId::of("ratings"));
    assert_ne!(RATINGS, TableId::of("user_vectors"));
    assert_eq!(format!("{}", TableId::of("x")).len(), 2 + 16 + 1);
}
