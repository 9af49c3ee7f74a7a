// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! pg-guest - PostgreSQL Guest Controller
//!
//! Runs inside a database instance of a database-as-a-service platform and
//! manages one PostgreSQL engine running in a container: install, configure,
//! start and stop, back up and restore, replicate, reclaim WAL archive space,
//! ship logs to object storage and apply platform modules.
//!
//! # Architecture
//!
//! ```text
//!        control plane (RPC over Unix socket, one JSON line per request)
//!                                   │
//!                                   ▼
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                         Manager (one lock)                         │
//! │ ┌──────────────┐ ┌───────────┐ ┌──────────┐ ┌───────────────────┐  │
//! │ │Configuration │ │   PgApp   │ │  Backup  │ │    Replication    │  │
//! │ │  + overrides │ │ + status  │ │ Manager  │ │    Coordinator    │  │
//! │ └──────────────┘ └─────┬─────┘ └────┬─────┘ └───────────────────┘  │
//! │ ┌──────────────┐ ┌─────┴─────┐ ┌────┴─────┐ ┌───────────────────┐  │
//! │ │ Log shipper  │ │Supervisor │ │  Admin   │ │  Module applier   │  │
//! │ └──────┬───────┘ └─────┬─────┘ └────┬─────┘ └───────────────────┘  │
//! └────────┼───────────────┼────────────┼──────────────────────────────┘
//!          ▼               ▼            ▼
//!    object store     docker CLI    PostgreSQL (socket)
//! ```
//!
//! Periodic workers (status probe, WAL cleanup) take the same lock as RPC
//! handlers, so every operation runs alone.
//!
//! # Configuration
//!
//! Loaded from `PG_GUEST_*` environment variables, see [`config::Config`].
//!
//! # Modules
//!
//! - [`manager`]: the operations exposed to the control plane
//! - [`handlers`] / [`server`]: request routing and the socket transport
//! - [`configuration`]: base file, codecs and override revisions
//! - [`supervisor`] / [`app`]: container lifecycle and status
//! - [`admin`]: users, databases and engine queries
//! - [`backup`], [`replication`], [`wal_archive`]: data protection
//! - [`guest_log`] / [`object_store`]: log publishing
//! - [`module_applier`]: platform modules

#![deny(missing_docs)]

/// Administrative client for the engine.
pub mod admin;

/// The engine container and its status.
pub mod app;

/// Base backups and restores.
pub mod backup;

/// Controller configuration loaded from environment variables.
pub mod config;

/// Engine configuration files and override revisions.
pub mod configuration;

/// Error types.
pub mod error;

/// Log publishing to object storage.
pub mod guest_log;

/// RPC request routing.
pub mod handlers;

/// Client-auth rules.
pub mod hba;

/// The datastore manager.
pub mod manager;

/// Module application.
pub mod module_applier;

/// Object store client.
pub mod object_store;

/// File and process helpers.
pub mod os;

/// Bounded polling.
pub mod poll;

/// Streaming replication.
pub mod replication;

/// Embeddable runtime.
pub mod runtime;

/// Unix socket RPC server.
pub mod server;

/// Service status.
pub mod status;

/// Background status refresh.
pub mod status_monitor;

/// Container supervisors.
pub mod supervisor;

/// Data volume helpers.
pub mod volume;

/// WAL archive reclamation.
pub mod wal_archive;

/// Background WAL archive cleanup.
pub mod wal_cleanup_worker;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use manager::{Manager, SharedManager};
pub use runtime::GuestRuntime;
