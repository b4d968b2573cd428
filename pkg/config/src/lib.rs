//! Persisted configuration: schema migration and the single owner of the
//! normalized record.

pub mod migration;
pub mod normalize;
pub mod store;

pub use migration::{
    MigrationEngine, MigrationError, MigrationOutcome, MigrationStep, StepFailure, infer_version,
};
pub use normalize::{Unreadable, normalize};
pub use store::{ConfigStore, LoadReport};
