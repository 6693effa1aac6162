//! Virtual kubelet library.
//!
//! The agent impersonates a cluster worker node. It registers a node object,
//! keeps it alive through a lease and periodic status, and runs the pods
//! scheduled onto it on a pluggable provider instead of a local runtime.
//!
//! ## Architecture
//!
//! ```text
//! Agent (supervisor)
//! ├── NodePingController   (provider liveness, single flight)
//! ├── NodeController       (node object and Ready condition)
//! ├── LeaseController      (heartbeat lease, gated on readiness)
//! ├── Reflector            (list/watch of pods on this node)
//! ├── Reconciler           (desired vs observed, per-key workers)
//! └── StatusMirror         (provider status back onto pods)
//! ```
//!
//! ## Modules
//!
//! - `control_plane`: cluster API seam, kube-backed and in-memory
//! - `provider`: workload provider contract and the mock provider
//! - `env`: container environment resolution before a pod reaches the provider
//! - `server`, `tls`: kubelet-compatible HTTP surface

pub mod config;
pub mod control_plane;
pub mod env;
pub mod events;
pub mod lease;
pub mod node;
pub mod ping;
pub mod provider;
pub mod reconciler;
pub mod reflector;
pub mod server;
pub mod status;
pub mod supervisor;
pub mod tls;
pub mod workload;

pub use supervisor::{Agent, AgentSettings, RunningAgent};
