//! A crate for bootstrapping a single-node Kubernetes cluster on a host you
//! can run commands on.
//!
//! The [`Bootstrapper`] takes a [`command_runner::Runner`] for the host and a
//! [`binaries::BinaryCache`] holding kubeadm, kubelet and kubectl, and brings
//! the host to the state a [`ClusterConfig`] describes: one active container
//! runtime, a version-appropriate kubeadm config, kubelet units, a CNI and
//! the enabled addons.
//!
//! # Example
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use bootstrapper::{binaries::DirectoryCache, Bootstrapper, ClusterConfig};
//! use command_runner::LocalRunner;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut cc = ClusterConfig::default_for("minikube", "v1.23.0");
//!     cc.nodes[0].ip = "192.168.49.2".to_string();
//!
//!     let bootstrapper = Bootstrapper::new(
//!         Arc::new(LocalRunner::new()),
//!         Arc::new(DirectoryCache::new("/home/me/.minikube/cache")),
//!     );
//!     bootstrapper.reconcile(&cc).await
//! }
//! ```

#![warn(missing_docs)]

pub mod addons;
pub mod binaries;
mod bootstrapper;
pub mod cni;
pub mod config;
pub mod constants;
pub mod cruntime;
pub mod driver;
mod error;
pub mod images;
pub mod kubeadm;
pub mod kubelet;
pub mod nodes;
pub mod reconcile;
pub mod storage;
mod templates;
pub mod versions;

pub use self::bootstrapper::Bootstrapper;
pub use error::{is_cancelled, is_retriable, BootstrapError, RetriableError};

#[doc(inline)]
pub use config::{ClusterConfig, KubernetesConfig, Node};
