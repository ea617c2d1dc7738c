//! consist-k8s: declarative resource-consistency operator for Kubernetes
//!
//! This crate provides a reusable employer/employee reconciliation engine
//! (diff, batched sync, lifecycle-finalizer gating, cache-consistency
//! expectations) plus the controllers built on it: managed-Service traffic
//! registration and WorkSet template-fingerprint claim lifecycle.

pub mod claims;
pub mod controller;
pub mod crd;
pub mod engine;
pub mod error;
pub mod expectations;

pub use crate::error::{Error, Result};
