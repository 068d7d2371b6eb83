//! I/O helpers for stager commands.

pub mod agent;
pub mod config;
pub mod git;
pub mod ledger;
pub mod process;
pub mod sandbox;
