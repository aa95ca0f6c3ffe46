//! spooky-facts: Fact store and fact manager
//!
//! Persists machine-scoped facts with expiry in an embedded redb database
//! and collects them from machines over command channels.

pub mod collector;
pub mod error;
pub mod import;
pub mod manager;
pub mod merge;
pub mod paths;
pub mod query;
pub mod store;
pub mod types;

pub use collector::FactCollector;
pub use error::FactError;
pub use import::{ExportEnvelope, ImportBatch, ImportOptions, ImportReport, parse_document};
pub use manager::{CollectionState, FactManager, LOCAL_TARGET, ManagerOptions};
pub use merge::MergeMode;
pub use paths::{DATABASE_FILE, FACTS_PATH_ENV, store_dir};
pub use query::FactQuery;
pub use store::FactStore;
pub use types::{Fact, FactCollection, FactSource, FactValue, MachineFacts, machine_id};
