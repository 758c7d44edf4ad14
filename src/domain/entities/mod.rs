pub mod position;
pub mod records;
pub mod snapshot;
