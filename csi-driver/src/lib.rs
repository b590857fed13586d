//! EFS CSI Driver Library
//!
//! Kubernetes CSI driver that provisions volumes as access points on a
//! shared network file system and mounts them on nodes through the
//! efs-utils mount helper.
//!
//! This library provides:
//! - CSI Identity, Controller, and Node service implementations
//! - Per-file-system GID allocation for access point owners
//! - A refcounted table of node mounts
//! - Supervision of the mount helper and reaping of its children
//! - A control-plane client seam with gRPC and in-memory implementations

/// CSI proto generated types
pub mod csi {
    tonic::include_proto!("csi.v1");
}

/// Control-plane agent proto generated types (client)
pub mod agent {
    tonic::include_proto!("efs_agent.v1");
}

pub mod capability;
pub mod cloud;
pub mod config;
pub mod controller;
pub mod driver;
pub mod gid;
pub mod identity;
pub mod locks;
pub mod metrics;
pub mod mount_table;
pub mod node;
pub mod platform;
pub mod stats;
pub mod supervisor;
pub mod taint;
pub mod types;

pub use controller::ControllerService;
pub use identity::IdentityService;
pub use node::NodeService;
