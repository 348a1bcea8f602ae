//! Helpers for the `proctree` binary.

pub mod logger;
