//! Per-resource request coalescing.
//!
//! Terraform walks the resource graph in parallel, so many binding resources
//! targeting the same policy are created or destroyed at the same time. A
//! [`ResourceBatcher`] funnels them into at most one pending read and one
//! pending read-modify-write per batching window.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, info_span, Instrument};

use crate::config::IamConfig;
use crate::error::IamError;
use crate::future::{Mutation, PolicyFuture};
use crate::model::Binding;
use crate::resolver::PrincipalResolver;
use crate::updater::ResourceIamUpdater;

#[derive(Debug, Default)]
struct BatcherState {
    get_future: Option<Arc<PolicyFuture>>,
    set_future: Option<Arc<PolicyFuture>>,
}

/// Coalesces policy reads and writes for one resource.
#[derive(Debug)]
pub struct ResourceBatcher {
    key: String,
    config: IamConfig,
    resolver: PrincipalResolver,
    state: Mutex<BatcherState>,
}

impl ResourceBatcher {
    /// Create a batcher for the resource identified by `key`.
    pub fn new(key: impl Into<String>, resolver: PrincipalResolver, config: IamConfig) -> Self {
        Self {
            key: key.into(),
            config,
            resolver,
            state: Mutex::new(BatcherState::default()),
        }
    }

    /// The mutex key this batcher serves.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Read the policy, sharing any read that has not completed yet.
    ///
    /// A new read runs once the batching delay has elapsed.
    pub fn get_policy(&self, updater: Arc<dyn ResourceIamUpdater>) -> Arc<PolicyFuture> {
        let future = {
            let mut state = self.state.lock();
            if let Some(existing) = state.get_future.as_ref().filter(|f| !f.is_completed()) {
                debug!(resource = %self.key, "Joining pending IAM policy read");
                return existing.clone();
            }
            let future = Arc::new(PolicyFuture::read());
            state.get_future = Some(future.clone());
            future
        };

        let delay = self.config.batch_delay;
        let task = future.clone();
        self.schedule(&future, async move {
            tokio::time::sleep(delay).await;
            task.execute_read(updater).await;
        });
        future
    }

    /// Queue a setter and/or remover for the next batched write.
    ///
    /// Joins the pending write if it has not started yet; its schedule is not
    /// extended. Otherwise a new write is scheduled after the batching delay.
    pub fn modify_policy(
        &self,
        updater: Arc<dyn ResourceIamUpdater>,
        setter: Option<Binding>,
        remover: Option<Binding>,
    ) -> Arc<PolicyFuture> {
        let mut mutation = Mutation::new(setter, remover);
        let future = {
            let mut state = self.state.lock();
            if let Some(existing) = state.set_future.as_ref() {
                match existing.add_mutation(mutation) {
                    Ok(()) => {
                        debug!(resource = %self.key, "Joining pending IAM policy update");
                        return existing.clone();
                    },
                    Err(rejected) => mutation = rejected,
                }
            }
            let future = Arc::new(PolicyFuture::write(mutation));
            state.set_future = Some(future.clone());
            future
        };

        debug!(resource = %self.key, delay_ms = self.config.batch_delay.as_millis() as u64, "Scheduling IAM policy update");
        let delay = self.config.batch_delay;
        let resolver = self.resolver.clone();
        let config = self.config;
        let task = future.clone();
        self.schedule(&future, async move {
            tokio::time::sleep(delay).await;
            task.execute_write(updater, resolver, config).await;
        });
        future
    }

    fn schedule<F>(&self, future: &PolicyFuture, work: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        match Handle::try_current() {
            Ok(handle) => {
                let span = info_span!("iam_batch", resource = %self.key, kind = ?future.kind());
                handle.spawn(work.instrument(span));
            },
            Err(_) => {
                future.seal();
                future.complete(Err(IamError::Configuration(
                    "IAM policy batching requires a running tokio runtime".to_string(),
                )));
            },
        }
    }
}
