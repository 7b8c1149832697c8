//! # libcsi — Simplified CSI node surface over QUIC
//!
//! `libcsi` implements a lightweight [Container Storage Interface][csi]
//! node-plugin layer that uses QUIC (via [`quinn`]) instead of gRPC for
//! transport.  Only the Identity and Node services are modeled; the
//! controller-side provisioning surface is a pass-through and lives outside
//! this crate.  The crate follows the project conventions: Tokio async
//! runtime, `tracing` for observability, `thiserror` for structured errors.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: volume identity, publish requests, plugin info. |
//! | [`error`] | [`CsiError`] — the error taxonomy shared across the driver. |
//! | [`message`] | [`CsiMessage`] protocol envelope for QUIC transport. |
//! | [`identity`] | [`CsiIdentity`] trait — plugin discovery & health. |
//! | [`node`] | [`CsiNode`] trait — stage, publish, unpublish, unstage. |
//! | [`transport`] | QUIC client/server built on `quinn`. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod error;
pub mod identity;
pub mod message;
pub mod node;
pub mod transport;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use error::CsiError;
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use node::CsiNode;
pub use types::*;
