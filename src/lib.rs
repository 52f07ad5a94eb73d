//! Host provisioning for the receiptd daemon.
//!
//! Creates the service account, its directories, font assets, init script
//! and configuration on a host root, converging on repeated runs.

pub mod account;
pub mod check;
pub mod cmd;
pub mod config;
pub mod error;
pub mod fsops;
pub mod paths;
pub mod provision;
pub mod service;
pub mod source;

pub use error::{AccountCreationError, FilesystemError, ProvisionError, StepFailure};
pub use provision::{Options, Provisioner, Step, StepReport};
