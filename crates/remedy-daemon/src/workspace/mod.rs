//! Working-directory leasing.
//!
//! Each repository has one clone directory under the workspace root. A task
//! must hold the directory's [`WorkdirLease`] for as long as it touches the
//! clone, so two tasks never share a working directory at the same time.

mod lease;

pub use lease::{WorkdirLease, WorkspaceError, WorkspaceManager};
