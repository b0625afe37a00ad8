//! Core library for jetski, which provisions k3s cluster nodes as local
//! Multipass VMs.
//!
//! The [`provision::Provisioner`] drives an instance through its lifecycle
//! (create → wait for Running → follow cloud-init → configure the cluster)
//! on top of a typed Multipass client, an SSH channel, polling helpers, and
//! a per-platform host network binder. Every external program is invoked
//! through [`process::CommandRunner`], so tests substitute a scripted host.

pub mod cidr;
pub mod cloud_init;
pub mod config;
pub mod files;
pub mod join;
pub mod kubeconfig;
pub mod logging;
pub mod multipass;
pub mod network;
pub mod process;
pub mod provision;
pub mod ssh;
pub mod test_support;
pub mod wait;

pub use cidr::Cidr;
pub use config::{InstanceConfig, JetskiConfig, NodeRole};
pub use multipass::{InstanceState, Multipass};
pub use process::{CommandRunner, ProcessCommandRunner};
pub use provision::{ProvisionError, ProvisionSettings, Provisioner};
