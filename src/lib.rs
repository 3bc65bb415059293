//! fleetgate - orchestrate fleets of isolated messaging-gateway workers
//!
//! Each managed instance is a fully isolated copy of a gateway worker bound
//! to its own network port, filesystem tree, and pair of databases (primary
//! data plus key material). [`InstanceManager`] owns the registry and the
//! lifecycle; [`DatabaseIsolationManager`] provisions per-instance storage
//! over an embedded-file (SQLite) or networked-relational (PostgreSQL)
//! backend; the subprocess supervisor is consumed through the
//! [`core::process::ProcessIsolationManager`] trait.

pub mod core;
pub mod db;
pub mod error;
pub mod persistence;

pub use crate::core::{
    FleetSettings, Instance, InstanceConfig, InstanceManager, InstanceStats, InstanceStatus,
    ResourceUsage,
};
pub use crate::db::{BackendKind, DatabaseIsolationManager, IsolatedDatabase};
pub use crate::error::{Error, Result};
