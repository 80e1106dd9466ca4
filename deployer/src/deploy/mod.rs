//! Deployment module

pub mod drift;
pub mod fsm;
pub mod orchestrator;
pub mod preflight;
