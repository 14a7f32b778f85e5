mod clean;
mod merge;
mod sync;

pub use clean::{clean_invalid_records, CleanReport};
pub use merge::{merge_stores, MergeReport};
pub use sync::{sync_checkpoints, SyncReport};
