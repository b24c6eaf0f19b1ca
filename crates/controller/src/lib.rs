//! Meshsync controller: reconcile core, ACL token reaper and the runner that
//! drives them from cluster watch signals.

#![forbid(unsafe_code)]

pub mod reconcile;
pub mod runner;
pub mod tokens;

pub use reconcile::{Outcome, Reconciler};
pub use runner::Runner;
pub use tokens::{CleanupReport, TokenReaper};
