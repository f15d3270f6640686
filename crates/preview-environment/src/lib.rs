//! PreviewEnvironment controller
//!
//! Converges each PreviewEnvironment record into an isolated namespace,
//! ingress routing and a GitOps deployment descriptor, estimates its cost,
//! and expires it when its TTL runs out.

#![deny(missing_docs)]

pub mod cleanup;
pub mod client;
pub mod config;
pub mod controller;
pub mod cost;
pub mod descriptor;
pub mod ingress;
pub mod materializer;
pub mod namespace;
pub mod quantity;

pub use cleanup::{CleanupScheduler, CleanupSummary};
pub use client::{ClusterClient, ClusterClientImpl, ManagedResource, ResourceRef};
pub use config::PreviewConfig;
pub use controller::{error_policy, reconcile, Context};
pub use materializer::{HealthState, Materializer, ResourceHealth};
