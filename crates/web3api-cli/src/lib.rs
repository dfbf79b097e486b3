//! Web3API command-line front end: check identifiers, resolve endpoints,
//! inspect packages and explain query plans.

pub mod commands;
pub mod config;

pub use config::{resolve_gateway, resolve_names, resolve_store, Settings};
