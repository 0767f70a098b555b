//! Remedy Library
//!
//! Core functionality for the Remedy issue remediation orchestrator:
//! - Task state machine and per-task event history
//! - Scheduler with a bounded pool of worker slots
//! - Supervision of the external code-modification tool
//! - GitHub, git and aider capability adapters
//! - SQLite storage for repositories and task records

pub mod capability;
pub mod orchestration;
pub mod service;
pub mod sink;
pub mod storage;
pub mod subprocess;
pub mod task;
pub mod workspace;
