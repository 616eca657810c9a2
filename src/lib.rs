//! Warden - per-user challenge containers with automatic expiry.
//!
//! A spawn request is authenticated against the CTF front-end, checked for a
//! live duplicate, given a free host port and started through the container
//! runtime. Every instance is recorded in a SQLite ledger, and a background
//! reaper stops instances once their template's lifetime has passed.

pub mod admission;
pub mod auth;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod error;
pub mod http_server;
pub mod ledger;
pub mod model;
pub mod orchestrator;
pub mod ports;
pub mod provisioner;
pub mod reaper;
pub mod runtime;
pub mod state;

pub use catalog::Catalog;
pub use config::Config;
pub use error::ProvisionError;
pub use ledger::Ledger;
pub use model::{Access, ActivityEntry, Instance, Template};
pub use orchestrator::{Grant, Orchestrator, StopOutcome};
pub use reaper::{Reaper, SweepReport};
pub use state::{AppState, Warden};
