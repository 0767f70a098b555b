//! GitHub integration.
//!
//! A reqwest-based client for the GitHub REST API covering issues, forks
//! and pull requests. Cloning and pushing go through [`GitCli`] with the
//! token supplied on the command line only.
//!
//! [`GitCli`]: crate::capability::GitCli

mod client;
pub mod types;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests;

pub use client::GitHubClient;
