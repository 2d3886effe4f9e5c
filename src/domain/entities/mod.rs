pub mod account;
pub mod recovery_job;
pub mod snapshot;
