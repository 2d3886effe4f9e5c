pub mod snapshot_poller;
pub mod watchdog_actor;
