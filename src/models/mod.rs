//! Data models shared by the engine boundary and the context layer.

pub mod row;
pub mod value;

pub use row::{ColumnIndex, Row};
pub use value::{FromValue, Value};
