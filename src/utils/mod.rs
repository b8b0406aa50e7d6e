//! Shared helpers for binaries and long-running services.

pub mod bootstrap;
pub mod retry;
