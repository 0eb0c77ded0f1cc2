pub mod executor;
pub mod row;
pub mod value;

pub use executor::{statement_body, OneShotExecutor};
pub use row::{materialize, Row};
pub use value::PgValue;
