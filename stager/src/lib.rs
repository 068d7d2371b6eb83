//! Repository staging for agent-driven test generation.
//!
//! This crate prepares third-party repositories for automated test
//! generation: it catalogs them, drives a coding agent through a build
//! session until the repository's own test suite runs, and then forks that
//! session once per test target. The architecture enforces a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (session identity, plans,
//!   command allow-lists). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, git, process
//!   execution, sandboxing, the agent gateway). Isolated to enable mocking
//!   in tests.
//!
//! Orchestration modules ([`session`], [`prepare`], [`catalog`]) coordinate
//! core logic with I/O to implement CLI commands.

pub mod catalog;
pub mod core;
pub mod exit_codes;
pub mod instructions;
pub mod io;
pub mod logging;
pub mod prepare;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
