mod classify;
mod config;
mod record;

pub use classify::{ContentVerdict, ResultClassifier};
pub use config::{HarvestConfig, ToolSpec};
pub use record::{
    normalize_identifier, Record, IDENTIFIER_FIELD, IDENTIFIER_WIDTH, QUERY_FIELD,
};
