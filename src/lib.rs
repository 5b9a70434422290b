//! HCP Provider IAM
//!
//! IAM policy batching and reconciliation for HCP infrastructure providers.
//!
//! # Overview
//!
//! Terraform applies resources in parallel. When many IAM binding resources
//! target the same project or organization, each would otherwise race to
//! read-modify-write the same policy and most would fail on ETag conflicts.
//! This crate coalesces them:
//!
//! - **Model**: [`Policy`], [`Binding`], [`Member`] and the role map used to
//!   mutate them ([`model`])
//! - **Principal resolution**: one batched directory lookup per write
//!   ([`resolver`])
//! - **Futures**: single-flight results shared by every caller in a batch,
//!   plus the conflict-retrying reconciliation loop ([`future`])
//! - **Batchers**: at most one pending read and one pending write per
//!   resource ([`batcher`]), kept in an injected [`BatcherRegistry`]
//! - **Resources**: binding and policy resource handlers and the policy
//!   document data source ([`resource`], [`document`])
//! - **Logging**: `tracing` integration ([`logging`])
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use hcp_provider_iam::{BatcherRegistry, HcpResourceIamUpdater, IamConfig};
//! use hcp_provider_iam::model::Binding;
//!
//! let registry = BatcherRegistry::new(directory, IamConfig::from_provider_config(&config)?);
//! let updater = Arc::new(HcpResourceIamUpdater::project("my-project", client));
//!
//! let policy = registry
//!     .modify_policy(updater, Some(Binding::single("roles/contributor", "user-1")), None)
//!     .wait()
//!     .await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batcher;
pub mod config;
pub mod document;
pub mod error;
pub mod future;
pub mod logging;
pub mod model;
pub mod registry;
pub mod resolver;
pub mod resource;
pub mod testing;
pub mod updater;
pub mod validation;

// Re-export main types at crate root
pub use batcher::ResourceBatcher;
pub use config::IamConfig;
pub use document::PolicyDocumentDataSource;
pub use error::IamError;
pub use future::{reconcile, Mutation, PolicyFuture};
pub use logging::{init_logging, init_logging_with_default, try_init_logging};
pub use model::{Binding, Member, MemberType, Policy};
pub use registry::BatcherRegistry;
pub use resolver::{Principal, PrincipalDirectory, PrincipalResolver, PrincipalType};
pub use resource::{HcpUpdaterFactory, IamBindingResource, IamPolicyResource, UpdaterFactory};
pub use updater::{HcpResourceIamUpdater, IamPolicyClient, ResourceIamUpdater, ResourceKind};

// Re-export async_trait for implementors of the collaborator traits
pub use async_trait::async_trait;

// Re-export commonly used external types
pub use serde_json;
pub use tracing;
