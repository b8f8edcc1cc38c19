//! `sshfleet` Core Library
//!
//! Shared functionality for `sshfleet` components:
//! - Host, job, transfer and result data model
//! - Manifest loading and validation
//! - OpenSSH client config lookup (`~/.ssh/config`)
//! - Common error types and tracing setup

pub mod config;
pub mod error;
pub mod model;
pub mod ssh_config;
pub mod tracing_init;

pub use config::Manifest;
pub use error::{Error, Result};
pub use model::{HostDescriptor, JobDescriptor, JobResult, TransferFailure, TransferSpec};
