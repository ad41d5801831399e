// ABOUTME: Library root for staging-sync
// ABOUTME: Table-by-table database refresh with anonymization, upserts and deletion reconciliation

pub mod config;
pub mod db;
pub mod error;
pub mod orchestrator;
pub mod planner;
pub mod postgres;
pub mod progress;
pub mod reconciler;
pub mod schema;
pub mod table_sync;
pub mod transform;
pub mod upsert;
pub mod utils;
pub mod value;

pub use db::{DatabaseAccess, Statement};
pub use error::{AccessError, SyncError};
pub use orchestrator::{ChainReport, HopReport, SyncOrchestrator};
pub use table_sync::{SourceConsistency, SyncJob, SyncOptions, TableReport, TableSynchronizer};
pub use transform::{MaskRule, TransformPolicy};
pub use upsert::UpsertStrategy;
pub use value::{Record, Value};
