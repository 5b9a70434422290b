//! IAM resource handlers.
//!
//! These sit between the provider's CRUD callbacks and the batching engine.
//! State is passed around as JSON objects, the same shape the provider
//! protocol carries.
//!
//! - [`IamBindingResource`] manages a single (role, principal) pair and leaves
//!   the rest of the policy alone. All its writes go through the batcher.
//! - [`IamPolicyResource`] owns the whole policy and replaces it on write.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::document::{decode_policy_data, encode_policy_data};
use crate::error::IamError;
use crate::model::{Binding, Policy};
use crate::registry::BatcherRegistry;
use crate::updater::{HcpResourceIamUpdater, IamPolicyClient, ResourceIamUpdater, ResourceKind};
use crate::validation::{validate_mutation, validate_policy};

/// Builds the updater for the resource a piece of state points at.
pub trait UpdaterFactory: Send + Sync + 'static {
    /// The state attribute holding the parent resource's ID.
    fn parent_attribute(&self) -> &str;

    /// The updater for the parent resource `parent_id`.
    fn updater(&self, parent_id: &str) -> Arc<dyn ResourceIamUpdater>;
}

/// [`UpdaterFactory`] for HCP resources reached through [`IamPolicyClient`].
#[derive(Clone)]
pub struct HcpUpdaterFactory {
    kind: ResourceKind,
    attribute: String,
    client: Arc<dyn IamPolicyClient>,
}

impl HcpUpdaterFactory {
    /// Create a factory for `kind` resources named by the `attribute` field.
    pub fn new(
        kind: ResourceKind,
        attribute: impl Into<String>,
        client: Arc<dyn IamPolicyClient>,
    ) -> Self {
        Self {
            kind,
            attribute: attribute.into(),
            client,
        }
    }

    /// Factory for `hcp_project_iam_*` resources.
    pub fn project(client: Arc<dyn IamPolicyClient>) -> Self {
        Self::new(ResourceKind::Project, "project_id", client)
    }

    /// Factory for `hcp_organization_iam_*` resources.
    pub fn organization(client: Arc<dyn IamPolicyClient>) -> Self {
        Self::new(ResourceKind::Organization, "organization_id", client)
    }

    /// Factory for `hcp_group_iam_*` resources.
    pub fn group(client: Arc<dyn IamPolicyClient>) -> Self {
        Self::new(ResourceKind::Group, "name", client)
    }

    /// Factory for `hcp_packer_bucket_iam_*` resources.
    pub fn bucket(client: Arc<dyn IamPolicyClient>) -> Self {
        Self::new(ResourceKind::Bucket, "resource_name", client)
    }
}

impl UpdaterFactory for HcpUpdaterFactory {
    fn parent_attribute(&self) -> &str {
        &self.attribute
    }

    fn updater(&self, parent_id: &str) -> Arc<dyn ResourceIamUpdater> {
        Arc::new(HcpResourceIamUpdater::new(
            self.kind,
            parent_id,
            self.client.clone(),
        ))
    }
}

fn required_str<'a>(state: &'a Value, attribute: &str) -> Result<&'a str, IamError> {
    match state.get(attribute).and_then(Value::as_str) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(IamError::Validation(format!(
            "attribute {:?} is required",
            attribute
        ))),
    }
}

fn set_attribute(state: &mut Value, attribute: &str, value: Value) -> Result<(), IamError> {
    match state.as_object_mut() {
        Some(map) => {
            map.insert(attribute.to_string(), value);
            Ok(())
        },
        None => Err(IamError::InvalidRequest(
            "resource state must be an object".to_string(),
        )),
    }
}

/// A non-authoritative `*_iam_binding` resource.
///
/// State: the factory's parent attribute, `role` and `principal_id`. Both
/// binding attributes force replacement, so there is no update.
pub struct IamBindingResource {
    registry: Arc<BatcherRegistry>,
    factory: Arc<dyn UpdaterFactory>,
}

impl IamBindingResource {
    /// Create the resource handler.
    pub fn new(registry: Arc<BatcherRegistry>, factory: Arc<dyn UpdaterFactory>) -> Self {
        Self { registry, factory }
    }

    fn decode(&self, state: &Value) -> Result<(Arc<dyn ResourceIamUpdater>, Binding), IamError> {
        let parent = required_str(state, self.factory.parent_attribute())?;
        let role = required_str(state, "role")?;
        let principal = required_str(state, "principal_id")?;
        let binding = Binding::single(role, principal);
        validate_mutation(&binding)?;
        Ok((self.factory.updater(parent), binding))
    }

    /// Grant the role to the principal.
    #[instrument(skip_all)]
    pub async fn create(&self, planned_state: Value) -> Result<Value, IamError> {
        let (updater, binding) = self.decode(&planned_state)?;
        info!(resource = %updater.describe(), role = %binding.role_id, "Creating IAM binding");
        self.registry
            .modify_policy(updater, Some(binding), None)
            .wait()
            .await?;
        Ok(planned_state)
    }

    /// Refresh the binding.
    ///
    /// Returns `None` once the principal no longer holds the role, so the
    /// caller drops the resource from state.
    #[instrument(skip_all)]
    pub async fn read(&self, current_state: Value) -> Result<Option<Value>, IamError> {
        let (updater, binding) = self.decode(&current_state)?;
        let policy = self.registry.get_policy(updater).wait().await?;

        let principal = &binding.members[0].member_id;
        if policy.has_member(&binding.role_id, principal) {
            Ok(Some(current_state))
        } else {
            warn!(role = %binding.role_id, principal = %principal, "IAM binding no longer present, removing from state");
            Ok(None)
        }
    }

    /// Revoke the role from the principal.
    #[instrument(skip_all)]
    pub async fn delete(&self, current_state: Value) -> Result<(), IamError> {
        let (updater, binding) = self.decode(&current_state)?;
        info!(resource = %updater.describe(), role = %binding.role_id, "Deleting IAM binding");
        self.registry
            .modify_policy(updater, None, Some(binding))
            .wait()
            .await?;
        Ok(())
    }
}

/// An authoritative `*_iam_policy` resource.
///
/// State: the factory's parent attribute, `policy_data` (see
/// [`crate::document`]) and the computed `etag`.
pub struct IamPolicyResource {
    registry: Arc<BatcherRegistry>,
    factory: Arc<dyn UpdaterFactory>,
}

impl IamPolicyResource {
    /// Create the resource handler.
    pub fn new(registry: Arc<BatcherRegistry>, factory: Arc<dyn UpdaterFactory>) -> Self {
        Self { registry, factory }
    }

    fn updater(&self, state: &Value) -> Result<Arc<dyn ResourceIamUpdater>, IamError> {
        let parent = required_str(state, self.factory.parent_attribute())?;
        Ok(self.factory.updater(parent))
    }

    /// Replace the policy with `policy_data`.
    #[instrument(skip_all)]
    pub async fn create(&self, planned_state: Value) -> Result<Value, IamError> {
        self.write(planned_state).await
    }

    /// Replace the policy with the new `policy_data`.
    #[instrument(skip_all)]
    pub async fn update(&self, _prior_state: Value, planned_state: Value) -> Result<Value, IamError> {
        self.write(planned_state).await
    }

    async fn write(&self, mut state: Value) -> Result<Value, IamError> {
        let updater = self.updater(&state)?;
        let mut policy = decode_policy_data(required_str(&state, "policy_data")?)?;
        validate_policy(&policy)?;

        let current = updater
            .get_resource_iam_policy()
            .await
            .map_err(IamError::into_fetch)?;
        policy.etag = current.etag;
        info!(resource = %updater.describe(), bindings = policy.bindings.len(), "Setting IAM policy");
        let written = updater.set_resource_iam_policy(policy).await?;

        set_attribute(&mut state, "etag", Value::String(written.etag))?;
        Ok(state)
    }

    /// Refresh the policy.
    ///
    /// The stored `policy_data` text is kept when the remote policy only
    /// differs in ordering. Returns `None` if the parent resource is gone.
    #[instrument(skip_all)]
    pub async fn read(&self, mut current_state: Value) -> Result<Option<Value>, IamError> {
        let updater = self.updater(&current_state)?;
        let remote = match self.registry.get_policy(updater).wait().await {
            Ok(policy) => policy,
            Err(err) if err.is_not_found() => {
                warn!(error = %err, "Parent resource not found, removing IAM policy from state");
                return Ok(None);
            },
            Err(err) => return Err(err),
        };

        let unchanged = current_state
            .get("policy_data")
            .and_then(Value::as_str)
            .and_then(|data| decode_policy_data(data).ok())
            .is_some_and(|stored| stored.equivalent(&remote));
        if unchanged {
            debug!("IAM policy unchanged");
        } else {
            let data = encode_policy_data(&remote)?;
            set_attribute(&mut current_state, "policy_data", Value::String(data))?;
        }
        set_attribute(&mut current_state, "etag", Value::String(remote.etag))?;
        Ok(Some(current_state))
    }

    /// Remove every binding from the policy.
    #[instrument(skip_all)]
    pub async fn delete(&self, current_state: Value) -> Result<(), IamError> {
        let updater = self.updater(&current_state)?;
        let current = updater
            .get_resource_iam_policy()
            .await
            .map_err(IamError::into_fetch)?;
        info!(resource = %updater.describe(), "Clearing IAM policy");
        updater
            .set_resource_iam_policy(Policy::empty(current.etag))
            .await?;
        Ok(())
    }
}
