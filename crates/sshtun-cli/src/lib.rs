//! Library side of the `sshtun` binary: configuration loading and logging

pub mod config;
pub mod logging;
