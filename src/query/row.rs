use super::value::PgValue;
use serde_json::Value;
use tracing::debug;

/// One result row: column name to value, in select-list order
pub type Row = serde_json::Map<String, Value>;

/// Convert a driver row into an ordered column map.
///
/// SQL NULL is the only source of JSON null; every non-null value keeps a
/// representation, see [`PgValue`].
pub fn materialize(row: &tokio_postgres::Row) -> Row {
    let mut map = Row::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let value = match row.try_get::<_, PgValue>(idx) {
            Ok(PgValue(value)) => value,
            Err(e) => {
                debug!("Column {} ({}) could not be decoded: {}", column.name(), column.type_(), e);
                Value::Null
            }
        };
        map.insert(column.name().to_string(), value);
    }
    map
}
