//! Policy documents.
//!
//! `policy_data` is the JSON form of a policy's bindings that the
//! authoritative policy resource stores in state. The policy document data
//! source builds it from a list of `{ role, principals }` bindings, resolving
//! each principal's type in a single directory lookup.
//!
//! ```json
//! {
//!   "bindings": [
//!     { "role": "roles/contributor", "principals": ["user-1", "group-2"] }
//!   ]
//! }
//! ```

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::IamError;
use crate::model::{Binding, Policy, RoleMap};
use crate::resolver::PrincipalResolver;
use crate::validation::{validate_policy, MAX_POLICY_PRINCIPALS};

#[derive(Serialize, Deserialize)]
struct PolicyData {
    #[serde(default)]
    bindings: Vec<Binding>,
}

/// Encode a policy's bindings as canonical `policy_data` JSON.
///
/// Bindings and members are sorted, so equivalent policies encode to the
/// same text. The ETag is not included.
pub fn encode_policy_data(policy: &Policy) -> Result<String, IamError> {
    let canonical = Policy::from_map("", &policy.to_map());
    let data = PolicyData {
        bindings: canonical.bindings,
    };
    Ok(serde_json::to_string(&data)?)
}

/// Decode `policy_data` JSON into a policy with an empty ETag.
pub fn decode_policy_data(data: &str) -> Result<Policy, IamError> {
    let data: PolicyData = serde_json::from_str(data)?;
    Ok(Policy::new("", data.bindings))
}

/// One binding block of the policy document data source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentBinding {
    /// The role ID.
    pub role: String,
    /// Principal IDs granted the role.
    pub principals: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DocumentConfig {
    #[serde(default)]
    bindings: Vec<DocumentBinding>,
}

/// The `hcp_iam_policy` data source.
#[derive(Debug, Clone)]
pub struct PolicyDocumentDataSource {
    resolver: PrincipalResolver,
}

impl PolicyDocumentDataSource {
    /// Create the data source.
    pub fn new(resolver: PrincipalResolver) -> Self {
        Self { resolver }
    }

    /// Build the policy described by `bindings`.
    ///
    /// Repeated roles are merged. Every principal is resolved in one batch.
    #[instrument(skip(self, bindings), fields(bindings = bindings.len()))]
    pub async fn build(&self, bindings: &[DocumentBinding]) -> Result<Policy, IamError> {
        let mut principals = BTreeSet::new();
        for binding in bindings {
            if binding.role.trim().is_empty() {
                return Err(IamError::Validation(
                    "every binding must specify a role".to_string(),
                ));
            }
            if binding.principals.is_empty() {
                return Err(IamError::Validation(format!(
                    "binding for role {} must list at least one principal",
                    binding.role
                )));
            }
            principals.extend(binding.principals.iter().cloned());
        }
        if principals.len() > MAX_POLICY_PRINCIPALS {
            return Err(IamError::Validation(format!(
                "policy references {} principals, the maximum is {}",
                principals.len(),
                MAX_POLICY_PRINCIPALS
            )));
        }

        let ids: Vec<String> = principals.into_iter().collect();
        let member_types = self.resolver.resolve_types(&ids).await?;

        let mut roles = RoleMap::new();
        for binding in bindings {
            let members = roles.entry(binding.role.clone()).or_default();
            for principal in &binding.principals {
                members.insert(principal.clone(), member_types.get(principal).copied());
            }
        }
        let policy = Policy::from_map("", &roles);
        validate_policy(&policy)?;
        debug!(roles = policy.bindings.len(), "Built IAM policy document");
        Ok(policy)
    }

    /// Read the data source: returns `config` with `policy_data` filled in.
    pub async fn read(&self, config: serde_json::Value) -> Result<serde_json::Value, IamError> {
        let parsed: DocumentConfig = serde_json::from_value(config.clone())?;
        let policy = self.build(&parsed.bindings).await?;

        let mut state = config;
        match state.as_object_mut() {
            Some(map) => {
                map.insert(
                    "policy_data".to_string(),
                    serde_json::Value::String(encode_policy_data(&policy)?),
                );
            },
            None => {
                return Err(IamError::InvalidRequest(
                    "data source configuration must be an object".to_string(),
                ))
            },
        }
        Ok(state)
    }
}
