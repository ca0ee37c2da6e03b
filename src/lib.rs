//! Remote orchestration for a cache fleet: installs Redis and stunnel over
//! SSH, lays out SHARDED, STANDALONE or CLUSTER topologies, distributes the
//! tunnel certificate and publishes the result to each host's directory.

pub mod auth;
pub mod certificate;
pub mod cluster;
pub mod commands_server;
pub mod commands_task;
pub mod config;
pub mod db;
pub mod directory;
pub mod error;
pub mod installer;
pub mod ldap_tools;
pub mod models;
pub mod os;
pub mod progress;
pub mod proxy;
pub mod remote;
pub mod security;
pub mod services;
pub mod ssh_client;
pub mod state;
pub mod stunnel;
pub mod task_helpers;
pub mod task_runner;
pub mod task_types;
pub mod task_worker;
pub mod templates;
pub mod topology;
pub mod utils;

#[cfg(test)]
mod test_support;

pub use error::{ProvisionError, Result};
