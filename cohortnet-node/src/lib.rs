//! Library facade for the `cohortnet-node` binary.
//!
//! The config loader and service live here so integration tests can drive a
//! node against a scratch data directory without going through the CLI.

pub mod config;
pub mod service;
