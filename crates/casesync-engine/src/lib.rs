//! Case synchronization engine.
//!
//! A sync run lists every questionnaire in a Blaise server park, keeps the
//! ones whose name starts with the requested survey prefix, and merge-copies
//! each questionnaire's `_Form` table into its `_UNEDITED_Form` or
//! `_EDIT_Form` shadow table, one database transaction per questionnaire.
//!
//! ```text
//! QuestionnaireDirectory -> filter::select -> Orchestrator
//!                                               |- provision::ensure_unedited
//!                                               \- MergeCopier::merge
//! ```

pub mod config;
pub mod connect;
pub mod directory;
pub mod error;
pub mod filter;
pub mod merge;
pub mod observability;
pub mod orchestrator;
pub mod provision;
pub mod questionnaire;
pub mod trigger;

pub use config::{BlaiseConfig, DatabaseConfig, FailurePolicy, MergeColumns, ServiceConfig, SyncConfig};
pub use connect::connect_database;
pub use directory::{BlaiseDirectory, DirectoryError, QuestionnaireDirectory};
pub use error::{ConfigError, SyncError, SyncResult};
pub use merge::MergeCopier;
pub use orchestrator::{MergeOutcome, Orchestrator, QuestionnaireOutcome, SyncReport};
pub use questionnaire::{Questionnaire, SyncMode, TableRefs};
pub use trigger::{TriggerRequest, TriggerResponse, trigger};

pub use casesync_db::CancelToken;
