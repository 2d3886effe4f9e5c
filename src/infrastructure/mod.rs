pub mod snapshot_reader;
pub mod snapshot_store;
pub mod terminal_process;
