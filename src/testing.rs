//! Testing utilities for IAM integrations.
//!
//! In-memory stand-ins for the HCP policy API and the principal directory,
//! with call counters and scripted failures, so batching behaviour can be
//! exercised without a remote.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use hcp_provider_iam::model::Policy;
//! use hcp_provider_iam::testing::{InMemoryIamClient, StaticDirectory};
//! use hcp_provider_iam::resolver::PrincipalType;
//!
//! let client = Arc::new(InMemoryIamClient::new());
//! client.insert("project/p1", Policy::empty("e1"));
//! let directory = Arc::new(StaticDirectory::new().with_principal("u1", PrincipalType::User));
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::IamError;
use crate::model::Policy;
use crate::resolver::{Principal, PrincipalDirectory, PrincipalType};
use crate::updater::IamPolicyClient;

/// An in-memory IAM policy store with ETag checking.
///
/// Writes with a non-empty, stale ETag fail with [`IamError::Conflict`];
/// writes with an empty ETag are unconditional. Every successful write gets
/// a fresh ETag.
#[derive(Debug, Default)]
pub struct InMemoryIamClient {
    policies: Mutex<HashMap<String, Policy>>,
    etag_counter: AtomicUsize,
    get_calls: AtomicUsize,
    set_calls: AtomicUsize,
    get_errors: Mutex<VecDeque<IamError>>,
    set_errors: Mutex<VecDeque<IamError>>,
    persistent_set_error: Mutex<Option<IamError>>,
    written: Mutex<Vec<Policy>>,
}

impl InMemoryIamClient {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the policy for `resource_name`.
    pub fn insert(&self, resource_name: &str, policy: Policy) {
        self.policies.lock().insert(resource_name.to_string(), policy);
    }

    /// The stored policy for `resource_name`.
    pub fn policy(&self, resource_name: &str) -> Option<Policy> {
        self.policies.lock().get(resource_name).cloned()
    }

    /// Simulate an out-of-band write by bumping the stored ETag.
    pub fn touch(&self, resource_name: &str) {
        let etag = self.next_etag();
        if let Some(policy) = self.policies.lock().get_mut(resource_name) {
            policy.etag = etag;
        }
    }

    /// Fail the next reads with `errors`, in order.
    pub fn fail_next_gets(&self, errors: impl IntoIterator<Item = IamError>) {
        self.get_errors.lock().extend(errors);
    }

    /// Fail the next writes with `errors`, in order.
    pub fn fail_next_sets(&self, errors: impl IntoIterator<Item = IamError>) {
        self.set_errors.lock().extend(errors);
    }

    /// Fail every write with `error`.
    pub fn fail_all_sets(&self, error: IamError) {
        *self.persistent_set_error.lock() = Some(error);
    }

    /// Number of `get_iam_policy` calls.
    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    /// Number of `set_iam_policy` calls, failed ones included.
    pub fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }

    /// Every policy submitted to `set_iam_policy`, in call order.
    pub fn written(&self) -> Vec<Policy> {
        self.written.lock().clone()
    }

    fn next_etag(&self) -> String {
        format!("etag-{}", self.etag_counter.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait::async_trait]
impl IamPolicyClient for InMemoryIamClient {
    async fn get_iam_policy(&self, resource_name: &str) -> Result<Policy, IamError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.get_errors.lock().pop_front() {
            return Err(err);
        }
        self.policies
            .lock()
            .get(resource_name)
            .cloned()
            .ok_or_else(|| IamError::NotFound(resource_name.to_string()))
    }

    async fn set_iam_policy(
        &self,
        resource_name: &str,
        policy: Policy,
    ) -> Result<Policy, IamError> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        self.written.lock().push(policy.clone());
        if let Some(err) = self.persistent_set_error.lock().clone() {
            return Err(err);
        }
        if let Some(err) = self.set_errors.lock().pop_front() {
            return Err(err);
        }

        let mut policies = self.policies.lock();
        if let Some(current) = policies.get(resource_name) {
            if !policy.etag.is_empty() && policy.etag != current.etag {
                return Err(IamError::Conflict(format!(
                    "etag {} does not match {}",
                    policy.etag, current.etag
                )));
            }
        }
        let stored = Policy::new(self.next_etag(), policy.bindings);
        policies.insert(resource_name.to_string(), stored.clone());
        Ok(stored)
    }
}

/// A principal directory backed by a fixed table.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    principals: HashMap<String, PrincipalType>,
    calls: AtomicUsize,
    requests: Mutex<Vec<Vec<String>>>,
    failure: Mutex<Option<IamError>>,
}

impl StaticDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a principal.
    pub fn with_principal(mut self, id: impl Into<String>, principal_type: PrincipalType) -> Self {
        self.principals.insert(id.into(), principal_type);
        self
    }

    /// Fail every lookup with `error`.
    pub fn fail_with(&self, error: IamError) {
        *self.failure.lock() = Some(error);
    }

    /// Number of batch lookups.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The IDs requested by each lookup, in call order.
    pub fn requests(&self) -> Vec<Vec<String>> {
        self.requests.lock().clone()
    }
}

#[async_trait::async_trait]
impl PrincipalDirectory for StaticDirectory {
    async fn batch_get_principals(&self, ids: &[String]) -> Result<Vec<Principal>, IamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(ids.to_vec());
        if let Some(err) = self.failure.lock().clone() {
            return Err(err);
        }
        Ok(ids
            .iter()
            .filter_map(|id| {
                self.principals
                    .get(id)
                    .map(|principal_type| Principal::new(id.clone(), *principal_type))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Binding;

    #[tokio::test]
    async fn test_in_memory_client_etag_checks() {
        let client = InMemoryIamClient::new();
        client.insert("project/p1", Policy::empty("e1"));

        let written = client
            .set_iam_policy("project/p1", Policy::empty("e1"))
            .await
            .unwrap();
        assert_eq!(written.etag, "etag-1");

        let err = client
            .set_iam_policy("project/p1", Policy::empty("e1"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let forced = client
            .set_iam_policy(
                "project/p1",
                Policy::new("", vec![Binding::single("roles/viewer", "u1")]),
            )
            .await
            .unwrap();
        assert_eq!(forced.etag, "etag-2");
        assert_eq!(client.set_calls(), 3);
        assert_eq!(client.written().len(), 3);
    }

    #[tokio::test]
    async fn test_in_memory_client_scripted_errors() {
        let client = InMemoryIamClient::new();
        client.insert("project/p1", Policy::empty("e1"));
        client.fail_next_gets([IamError::Fetch("flaky".to_string())]);

        assert!(client.get_iam_policy("project/p1").await.is_err());
        assert!(client.get_iam_policy("project/p1").await.is_ok());
        assert!(client.get_iam_policy("project/none").await.unwrap_err().is_not_found());
        assert_eq!(client.get_calls(), 3);

        client.touch("project/p1");
        assert_eq!(client.policy("project/p1").unwrap().etag, "etag-1");
    }

    #[tokio::test]
    async fn test_static_directory_records_requests() {
        let directory = StaticDirectory::new().with_principal("u1", PrincipalType::User);
        let found = directory
            .batch_get_principals(&["u1".to_string(), "nope".to_string()])
            .await
            .unwrap();

        assert_eq!(found, vec![Principal::new("u1", PrincipalType::User)]);
        assert_eq!(directory.calls(), 1);
        assert_eq!(directory.requests()[0].len(), 2);
    }
}
