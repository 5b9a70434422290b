//! The batcher registry.
//!
//! One [`BatcherRegistry`] is built when the provider is configured and
//! handed to every IAM resource. It owns the batcher for each policy-bearing
//! resource, created on first use and kept for the life of the process,
//! which is a single Terraform operation.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::batcher::ResourceBatcher;
use crate::config::IamConfig;
use crate::future::PolicyFuture;
use crate::model::Binding;
use crate::resolver::{PrincipalDirectory, PrincipalResolver};
use crate::updater::ResourceIamUpdater;

/// Maps resource mutex keys to their [`ResourceBatcher`].
#[derive(Debug)]
pub struct BatcherRegistry {
    batchers: DashMap<String, Arc<ResourceBatcher>>,
    resolver: PrincipalResolver,
    config: IamConfig,
}

impl BatcherRegistry {
    /// Create a registry whose batchers resolve principals through `directory`.
    pub fn new(directory: Arc<dyn PrincipalDirectory>, config: IamConfig) -> Self {
        Self {
            batchers: DashMap::new(),
            resolver: PrincipalResolver::new(directory),
            config,
        }
    }

    /// The batcher for `key`, created if this is the first request for it.
    ///
    /// `key` must be unique per remote policy-bearing resource.
    pub fn get_batch(&self, key: &str) -> Arc<ResourceBatcher> {
        if let Some(existing) = self.batchers.get(key) {
            return existing.value().clone();
        }
        self.batchers
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!(resource = %key, "Creating IAM policy batcher");
                Arc::new(ResourceBatcher::new(
                    key,
                    self.resolver.clone(),
                    self.config,
                ))
            })
            .value()
            .clone()
    }

    /// Batched read of `updater`'s policy.
    pub fn get_policy(&self, updater: Arc<dyn ResourceIamUpdater>) -> Arc<PolicyFuture> {
        self.get_batch(&updater.mutex_key()).get_policy(updater)
    }

    /// Batched modification of `updater`'s policy.
    pub fn modify_policy(
        &self,
        updater: Arc<dyn ResourceIamUpdater>,
        setter: Option<Binding>,
        remover: Option<Binding>,
    ) -> Arc<PolicyFuture> {
        self.get_batch(&updater.mutex_key())
            .modify_policy(updater, setter, remover)
    }

    /// The shared principal resolver.
    pub fn resolver(&self) -> &PrincipalResolver {
        &self.resolver
    }

    /// Batching and retry settings.
    pub fn config(&self) -> IamConfig {
        self.config
    }

    /// Number of batchers created so far.
    pub fn len(&self) -> usize {
        self.batchers.len()
    }

    /// Whether no batcher has been created yet.
    pub fn is_empty(&self) -> bool {
        self.batchers.is_empty()
    }
}
