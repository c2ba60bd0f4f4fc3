//! CLI command implementations.

pub mod check;
pub mod reconcile;
pub mod restore;
pub mod run;
