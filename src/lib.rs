//! lb-node - keeps a local HAProxy in step with an etcd backend registry
//!
//! This library provides the pieces of a level-triggered control loop that:
//! - Waits for the registry to become reachable at startup
//! - Watches a key prefix for backend registrations, resuming from a cursor
//! - Re-reads the full backend set on every change and renders a proxy config
//! - Validates the candidate with the proxy's own checker before installing it
//! - Atomically publishes the config and hands traffic to a new proxy instance
//! - Never tears down a working proxy because the registry looks empty

pub mod backend;
pub mod backoff;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod install;
pub mod process;
pub mod reconcile;
pub mod registry;
pub mod render;
pub mod watch;
