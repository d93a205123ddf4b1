mod db;
mod error;
mod records;
mod schema;

pub use db::{StreamDb, streams};
pub use error::{Error, Result};
pub use records::StreamEntry;
