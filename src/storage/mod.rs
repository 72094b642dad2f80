pub mod engine;
pub mod filter;
pub mod memory;

pub use engine::{ChangeEvent, ChangeKind, RecordStore};
pub use filter::{Filter, Predicate, SortDirection};
pub use memory::{InMemoryRecordStore, StoreOp};
