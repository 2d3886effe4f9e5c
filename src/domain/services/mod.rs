pub mod account_registry;
pub mod recovery_plan;
pub mod snapshot_normalizer;
pub mod summary;
pub mod watchdog;
