pub mod bridge_handler;
