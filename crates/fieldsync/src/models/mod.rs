//! Domain models for sync bookkeeping

mod lock_record;
mod row;
mod sync_state;

pub use lock_record::LockRecord;
pub use row::{Row, value_text};
pub use sync_state::{STUCK_THRESHOLD_SECS, SyncPhase, SyncState};
