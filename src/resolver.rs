//! Batched principal type resolution.
//!
//! Binding members must carry their principal type when written. The resolver
//! looks up every principal in one directory call and maps the directory's
//! principal types onto [`MemberType`].

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::error::IamError;
use crate::model::MemberType;

/// The principal type reported by the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrincipalType {
    /// The directory did not report a type.
    Unspecified,
    /// A human user.
    User,
    /// A group.
    Group,
    /// A service principal.
    ServicePrincipal,
}

impl PrincipalType {
    /// The binding member type for this principal type, if it has one.
    pub fn member_type(self) -> Option<MemberType> {
        match self {
            Self::User => Some(MemberType::User),
            Self::Group => Some(MemberType::Group),
            Self::ServicePrincipal => Some(MemberType::ServicePrincipal),
            Self::Unspecified => None,
        }
    }
}

/// A principal returned by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// The principal ID.
    pub id: String,
    /// The principal's type.
    pub principal_type: PrincipalType,
}

impl Principal {
    /// Create a principal.
    pub fn new(id: impl Into<String>, principal_type: PrincipalType) -> Self {
        Self {
            id: id.into(),
            principal_type,
        }
    }
}

/// The principal directory (the HCP IAM service's batch principal lookup).
#[async_trait::async_trait]
pub trait PrincipalDirectory: Send + Sync + 'static {
    /// Look up all `ids` in a single call.
    async fn batch_get_principals(&self, ids: &[String]) -> Result<Vec<Principal>, IamError>;
}

/// Resolves principal IDs to binding member types.
#[derive(Clone)]
pub struct PrincipalResolver {
    directory: Arc<dyn PrincipalDirectory>,
}

impl std::fmt::Debug for PrincipalResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrincipalResolver").finish_non_exhaustive()
    }
}

impl PrincipalResolver {
    /// Create a resolver backed by `directory`.
    pub fn new(directory: Arc<dyn PrincipalDirectory>) -> Self {
        Self { directory }
    }

    /// Resolve the member type of every principal in `ids`.
    ///
    /// `ids` should already be deduplicated. An empty input makes no
    /// directory call. Any directory failure, unknown principal type or
    /// principal missing from the response fails the whole batch.
    #[instrument(skip(self, ids), fields(principals = ids.len()))]
    pub async fn resolve_types(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, MemberType>, IamError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let principals = self
            .directory
            .batch_get_principals(ids)
            .await
            .map_err(|e| match e {
                IamError::Resolution(msg) => IamError::Resolution(msg),
                other => IamError::Resolution(other.to_string()),
            })?;

        let mut resolved = HashMap::with_capacity(principals.len());
        for principal in principals {
            let member_type = principal.principal_type.member_type().ok_or_else(|| {
                warn!(principal = %principal.id, "Principal has no usable type");
                IamError::Resolution(format!(
                    "principal {} has an unsupported type {:?}",
                    principal.id, principal.principal_type
                ))
            })?;
            resolved.insert(principal.id, member_type);
        }

        if let Some(missing) = ids.iter().find(|id| !resolved.contains_key(*id)) {
            return Err(IamError::Resolution(format!(
                "principal {} was not found",
                missing
            )));
        }

        debug!(resolved = resolved.len(), "Resolved principal types");
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticDirectory;
    use tokio_test::{assert_err, assert_ok};

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_resolve_types_single_batch() {
        let directory = Arc::new(
            StaticDirectory::new()
                .with_principal("u1", PrincipalType::User)
                .with_principal("g1", PrincipalType::Group)
                .with_principal("sp1", PrincipalType::ServicePrincipal),
        );
        let resolver = PrincipalResolver::new(directory.clone());

        let resolved = assert_ok!(resolver.resolve_types(&ids(&["u1", "g1", "sp1"])).await);
        assert_eq!(resolved["u1"], MemberType::User);
        assert_eq!(resolved["g1"], MemberType::Group);
        assert_eq!(resolved["sp1"], MemberType::ServicePrincipal);
        assert_eq!(directory.calls(), 1);
    }

    #[tokio::test]
    async fn test_resolve_types_empty_input_skips_directory() {
        let directory = Arc::new(StaticDirectory::new());
        let resolver = PrincipalResolver::new(directory.clone());

        let resolved = assert_ok!(resolver.resolve_types(&[]).await);
        assert!(resolved.is_empty());
        assert_eq!(directory.calls(), 0);
    }

    #[tokio::test]
    async fn test_resolve_types_unspecified_aborts_batch() {
        let directory = Arc::new(
            StaticDirectory::new()
                .with_principal("u1", PrincipalType::User)
                .with_principal("weird", PrincipalType::Unspecified),
        );
        let resolver = PrincipalResolver::new(directory);

        let err = assert_err!(resolver.resolve_types(&ids(&["u1", "weird"])).await);
        assert!(matches!(err, IamError::Resolution(_)));
        assert!(err.message().contains("weird"));
    }

    #[tokio::test]
    async fn test_resolve_types_missing_principal() {
        let directory = Arc::new(StaticDirectory::new().with_principal("u1", PrincipalType::User));
        let resolver = PrincipalResolver::new(directory);

        let err = assert_err!(resolver.resolve_types(&ids(&["u1", "ghost"])).await);
        assert_eq!(
            err,
            IamError::Resolution("principal ghost was not found".to_string())
        );
    }

    #[tokio::test]
    async fn test_resolve_types_directory_failure() {
        let directory = Arc::new(StaticDirectory::new());
        directory.fail_with(IamError::PermissionDenied("no access".to_string()));
        let resolver = PrincipalResolver::new(directory);

        let err = assert_err!(resolver.resolve_types(&ids(&["u1"])).await);
        assert!(matches!(err, IamError::Resolution(_)));
        assert!(err.message().contains("no access"));
    }
}
