pub mod bridge_service;
pub mod recovery_orchestrator;
