//! MT Bridge Library
//!
//! Snapshot bridge, outage watchdog and automated recovery for trading
//! terminals that only talk to the outside world through per-account JSON
//! snapshot files.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
pub mod rate_limit;
pub mod secrets;
pub mod task_runner;
