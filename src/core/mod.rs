pub mod error;
pub mod types;

pub use error::{EditError, Result, StoreError, StoreResult};
pub use types::{
    EditableRecord, FieldMap, LockRpc, RESERVED_COLUMNS, RecordId, RecordKind, Row, UserId,
};
