// Test code is allowed to panic on failure
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

//! Unit tests for the StarRocks operator
//!
//! This module contains unit tests for:
//! - Resource generators (StatefulSet, Service, autoscaler, CronJob, FE proxy)
//! - The content-hash apply engine
//! - Status derivation
//! - Storage expansion against an in-memory API server
//! - Full reconcile passes, including deletion and restarts

#[path = "../common/mod.rs"]
mod common;

mod reconcile;
mod resources;
mod storage_expansion;
