// Macros to make building schemas and records more ergonomic

/// Declares a [crate::Schema], the first column named is the primary key
///
/// ```
/// # use ralf::schema;
/// let schema = schema!(user: Str, rating: Float).unwrap();
/// assert_eq!(schema.primary_key(), "user");
/// ```
#[macro_export]
macro_rules! schema {
    ($key:ident : $kty:ident $(, $name:ident : $ty:ident)* $(,)?) => {
        $crate::Schema::new(
            stringify!($key),
            [
                (stringify!($key), $crate::ValueType::$kty),
                $((stringify!($name), $crate::ValueType::$ty),)*
            ],
        )
    };
}

/// Builds a [crate::Record] against a schema from `field => value` pairs
///
/// ```
/// # use ralf::{schema, record};
/// let schema = schema!(user: Str, rating: Float).unwrap();
/// let record = record!(schema, "user" => "1", "rating" => 3).unwrap();
/// assert_eq!(record.get("rating").and_then(|v| v.as_f64()), Some(3.0));
/// ```
#[macro_export]
macro_rules! record {
    ($schema:expr, $($field:expr => $value:expr),+ $(,)?) => {
        $schema.record([
            $(($field, $crate::Value::from($value)),)+
        ])
    };
}
