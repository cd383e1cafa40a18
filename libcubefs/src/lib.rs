//! # libcubefs — CubeFS CSI driver over QUIC
//!
//! `libcubefs` implements a [Container Storage Interface][csi] driver for the
//! CubeFS distributed filesystem.  Requests travel as JSON envelopes over QUIC
//! (via [`quinn`]); the controller service talks to the CubeFS masters over
//! HTTP, and the node service mounts volumes through the external
//! `cfs-client` FUSE helper.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `Volume`, `VolumeId`, capabilities, requests. |
//! | [`error`] | [`CsiError`] enum and its caller-visible [`StatusCode`]. |
//! | [`config`] | Backend paths and defaults, service mode, driver options. |
//! | [`descriptor`] | [`VolumeDescriptor`] built from request parameters. |
//! | [`master`] | Failover client for the CubeFS master HTTP API. |
//! | [`mounter`] | Mount-state probing and mount primitives. |
//! | [`client_conf`] | Persists the configuration read by `cfs-client`. |
//! | [`mount_helper`] | Runs `cfs-client`. |
//! | [`locks`] | Per-volume lock table for node operations. |
//! | [`message`] | [`CsiMessage`] protocol envelope for QUIC transport. |
//! | [`identity`] | [`CsiIdentity`] trait — plugin discovery & health. |
//! | [`controller`] | [`CsiController`] trait — volume create/delete. |
//! | [`node`] | [`CsiNode`] trait — stage, publish, unpublish, unstage. |
//! | [`transport`] | QUIC client/server built on `quinn`. |
//! | [`backend`] | The CubeFS backend implementing all three services. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod backend;
pub mod client_conf;
pub mod config;
pub mod controller;
pub mod descriptor;
pub mod error;
pub mod identity;
pub mod locks;
pub mod master;
pub mod message;
pub mod mount_helper;
pub mod mounter;
pub mod node;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export the most commonly used items at crate root for convenience.
pub use backend::CubeFsBackend;
pub use config::{BackendConfig, DriverOptions, ServiceMode};
pub use controller::CsiController;
pub use descriptor::VolumeDescriptor;
pub use error::{CsiError, StatusCode};
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use node::CsiNode;
pub use types::*;
