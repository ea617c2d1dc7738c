//! Concrete controllers built on the consistency engine
//!
//! Each controller is a reconcile adapter (or a direct reconciler for the
//! WorkSet claim lifecycle) wired to the shared expectation ledger.

pub mod traffic;
pub mod workset;

pub use traffic::{run_traffic_controller, TrafficAdapter, TrafficStatus};
pub use workset::{run_workset_controller, WorkSetState, WORKSET_FINALIZER, WORKSET_NAME_LABEL};
