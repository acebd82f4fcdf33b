//! k1: command-line front end of the provisioning orchestrator, plus the
//! process- and HTTP-backed capability adapters it runs with.

pub mod adapters;
pub mod cli;
pub mod commands;
pub mod logging;
