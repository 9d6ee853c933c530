// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! crconfig-core - CDN control plane
//!
//! This crate compiles the CRConfig document that request routers, health
//! monitors and cache agents consume, and versions it through append-only
//! snapshot tables in PostgreSQL.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │             Routers / Monitors / Cache agents (HTTP clients)             │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │  GET snapshot (ETag / If-Modified-Since)
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              http (axum)                                 │
//! │            cache_control ──► store ──► crconfig::make(Source)            │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               PostgreSQL                                 │
//! │   live tables ──snapshot──► *_snapshot tables (append-only) + pointer    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Snapshots
//!
//! Each registered live table has a `*_snapshot` shadow with the same
//! columns plus `deleted`, keyed by the live key and `last_updated`. A commit
//! copies changed rows in, appends deletion markers for rows that vanished,
//! and moves the CDN's row in the `snapshot` pointer table. Reading a
//! committed CRConfig compiles it from the latest shadow rows at or before
//! the pointer time, so every builder query runs unchanged against either
//! [`crconfig::Source`].
//!
//! | Operation | Entry point |
//! |-----------|-------------|
//! | Live preview | [`crconfig::make`] with [`crconfig::Source::Live`] |
//! | Commit | [`store::commit_snapshot`] |
//! | Commit after one delivery service change | [`store::snapshot_ds`] |
//! | Read committed | [`store::get_snapshot`] |
//! | Conditional read | [`cache_control::check_snapshot`] |
//!
//! # Freshness
//!
//! Every derived entity tracks the newest `last_updated` of the rows it was
//! built from ([`crconfig::LastModified`]). Conditional reads compare the
//! client's claimed time against the CDN's snapshot time; ETags encode that
//! time as `"v0-<base36 unix nanoseconds>"`.
//!
//! # Configuration
//!
//! The `crconfig-core` binary is configured through `CRCONFIG_*`
//! environment variables, see [`config::Config::from_env`].

#![deny(missing_docs)]

/// ETag encoding and conditional-request evaluation.
pub mod cache_control;

/// Server configuration loaded from environment variables.
pub mod config;

/// CRConfig document model and compiler.
pub mod crconfig;

/// Error types with kinds the HTTP layer maps to status codes.
pub mod error;

/// axum router for preview, commit and snapshot reads.
pub mod http;

/// Embedded database migrations.
pub mod migrations;

/// Monitoring document derived from a CRConfig.
pub mod monitoring;

/// Snapshot table registry and the generic snapshot algorithm.
pub mod snapshot;

/// Snapshot commit and retrieval.
pub mod store;
