//! Per-resource IAM policy access.
//!
//! Each IAM-policy-bearing resource type supplies a [`ResourceIamUpdater`].
//! The batcher only ever talks to a resource's policy through this trait.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::error::IamError;
use crate::model::Policy;

/// Read and write access to one resource's IAM policy.
#[async_trait::async_trait]
pub trait ResourceIamUpdater: Send + Sync + 'static {
    /// Fetch the current policy.
    ///
    /// Resource types without a default policy should return an empty policy
    /// when the remote reports the policy as missing.
    async fn get_resource_iam_policy(&self) -> Result<Policy, IamError>;

    /// Write `policy`, which must carry the ETag it was read with.
    ///
    /// A stale ETag must be reported as [`IamError::Conflict`].
    async fn set_resource_iam_policy(&self, policy: Policy) -> Result<Policy, IamError>;

    /// A stable key unique to the underlying policy-bearing resource.
    fn mutex_key(&self) -> String;

    /// Human-readable resource description for logs and errors.
    fn describe(&self) -> String {
        self.mutex_key()
    }
}

/// The generated HCP API client surface for IAM policies.
#[async_trait::async_trait]
pub trait IamPolicyClient: Send + Sync + 'static {
    /// `GET …/{resource_name}:getIamPolicy`
    async fn get_iam_policy(&self, resource_name: &str) -> Result<Policy, IamError>;

    /// `PUT …/{resource_name}:setIamPolicy`
    async fn set_iam_policy(&self, resource_name: &str, policy: Policy)
        -> Result<Policy, IamError>;
}

/// HCP resource types that carry an IAM policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// An HCP organization.
    Organization,
    /// An HCP project.
    Project,
    /// An IAM group.
    Group,
    /// A Packer registry bucket.
    Bucket,
}

impl ResourceKind {
    /// Prefix of the resource name, and of the mutex key.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Organization => "organization",
            Self::Project => "project",
            Self::Group => "group",
            Self::Bucket => "bucket",
        }
    }

    /// Whether callers may address this kind by bare ID.
    ///
    /// Organizations and projects are named `kind/id`; groups and buckets
    /// carry full service resource names such as `iam/…/group/…`.
    pub fn accepts_bare_id(self) -> bool {
        matches!(self, Self::Organization | Self::Project)
    }

    /// Whether the remote always has a policy for this kind of resource.
    ///
    /// Organizations and projects are created with a policy; groups and
    /// buckets only have one after the first write.
    pub fn has_default_policy(self) -> bool {
        matches!(self, Self::Organization | Self::Project)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// [`ResourceIamUpdater`] for an HCP resource reached through [`IamPolicyClient`].
#[derive(Clone)]
pub struct HcpResourceIamUpdater {
    kind: ResourceKind,
    resource_name: String,
    client: Arc<dyn IamPolicyClient>,
}

impl fmt::Debug for HcpResourceIamUpdater {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HcpResourceIamUpdater")
            .field("kind", &self.kind)
            .field("resource_name", &self.resource_name)
            .finish_non_exhaustive()
    }
}

impl HcpResourceIamUpdater {
    /// Create an updater for the resource of `kind` named `resource_name`.
    ///
    /// Organization and project IDs without a `kind/` prefix are prefixed,
    /// so both `project/abc` and `abc` address the same project. Group and
    /// bucket names are used as given.
    pub fn new(
        kind: ResourceKind,
        resource_name: impl Into<String>,
        client: Arc<dyn IamPolicyClient>,
    ) -> Self {
        let name = resource_name.into();
        let prefix = format!("{}/", kind.as_str());
        let resource_name = if !kind.accepts_bare_id() || name.starts_with(&prefix) {
            name
        } else {
            format!("{}{}", prefix, name)
        };
        Self {
            kind,
            resource_name,
            client,
        }
    }

    /// Updater for an organization.
    pub fn organization(id: impl Into<String>, client: Arc<dyn IamPolicyClient>) -> Self {
        Self::new(ResourceKind::Organization, id, client)
    }

    /// Updater for a project.
    pub fn project(id: impl Into<String>, client: Arc<dyn IamPolicyClient>) -> Self {
        Self::new(ResourceKind::Project, id, client)
    }

    /// Updater for an IAM group.
    pub fn group(resource_name: impl Into<String>, client: Arc<dyn IamPolicyClient>) -> Self {
        Self::new(ResourceKind::Group, resource_name, client)
    }

    /// Updater for a Packer registry bucket.
    pub fn bucket(resource_name: impl Into<String>, client: Arc<dyn IamPolicyClient>) -> Self {
        Self::new(ResourceKind::Bucket, resource_name, client)
    }

    /// The resource kind.
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// The full resource name, e.g. `project/abc`.
    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }
}

#[async_trait::async_trait]
impl ResourceIamUpdater for HcpResourceIamUpdater {
    #[instrument(skip(self), fields(resource = %self.resource_name))]
    async fn get_resource_iam_policy(&self) -> Result<Policy, IamError> {
        match self.client.get_iam_policy(&self.resource_name).await {
            Ok(policy) => Ok(policy),
            Err(err) if err.is_not_found() && !self.kind.has_default_policy() => {
                debug!("No policy set yet, treating as empty");
                Ok(Policy::default())
            },
            Err(err) => Err(err.into_fetch()),
        }
    }

    #[instrument(skip(self, policy), fields(resource = %self.resource_name, etag = %policy.etag))]
    async fn set_resource_iam_policy(&self, policy: Policy) -> Result<Policy, IamError> {
        self.client.set_iam_policy(&self.resource_name, policy).await
    }

    fn mutex_key(&self) -> String {
        format!("{}-iam-policy/{}", self.kind, self.resource_name)
    }

    fn describe(&self) -> String {
        format!("{} {:?}", self.kind, self.resource_name)
    }
}
