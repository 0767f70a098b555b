//! `SQLite` storage for Remedy.
//!
//! Persists registered repositories and a mirror of every task's snapshot,
//! so finished work stays visible after the process exits.

mod db;
mod models;
mod queries;
mod recorder;

pub use db::{Database, DatabaseError};
pub use models::*;
pub use recorder::TaskRecorder;
