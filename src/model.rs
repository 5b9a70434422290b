//! IAM policy data model.
//!
//! A [`Policy`] is a versioned list of role [`Binding`]s. During reconciliation
//! the policy is flattened into a [`RoleMap`] so members can be added and
//! removed in constant time, then rebuilt in a deterministic order.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// The kind of principal a binding member refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberType {
    /// A human user principal.
    User,
    /// A group of principals.
    Group,
    /// A machine (service principal) identity.
    ServicePrincipal,
}

impl fmt::Display for MemberType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::User => "USER",
            Self::Group => "GROUP",
            Self::ServicePrincipal => "SERVICE_PRINCIPAL",
        };
        f.write_str(name)
    }
}

/// A principal referenced by a binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// The principal ID.
    pub member_id: String,
    /// The resolved principal type, absent until resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_type: Option<MemberType>,
}

impl Member {
    /// Create a member whose type has not been resolved yet.
    pub fn unresolved(member_id: impl Into<String>) -> Self {
        Self {
            member_id: member_id.into(),
            member_type: None,
        }
    }

    /// Create a member with a known type.
    pub fn new(member_id: impl Into<String>, member_type: MemberType) -> Self {
        Self {
            member_id: member_id.into(),
            member_type: Some(member_type),
        }
    }
}

/// Associates one role with the members that hold it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    /// The role ID, e.g. `roles/viewer`.
    pub role_id: String,
    /// Members granted the role.
    #[serde(default)]
    pub members: Vec<Member>,
}

impl Binding {
    /// Create a binding.
    pub fn new(role_id: impl Into<String>, members: Vec<Member>) -> Self {
        Self {
            role_id: role_id.into(),
            members,
        }
    }

    /// A single (role, principal) pair, the shape every setter and remover takes.
    pub fn single(role_id: impl Into<String>, member_id: impl Into<String>) -> Self {
        Self::new(role_id, vec![Member::unresolved(member_id)])
    }
}

/// An IAM policy as stored by the remote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Opaque version token used for optimistic concurrency.
    #[serde(default)]
    pub etag: String,
    /// Role bindings.
    #[serde(default)]
    pub bindings: Vec<Binding>,
}

/// Role ID to member ID to (possibly unresolved) member type.
pub type RoleMap = BTreeMap<String, BTreeMap<String, Option<MemberType>>>;

impl Policy {
    /// Create a policy.
    pub fn new(etag: impl Into<String>, bindings: Vec<Binding>) -> Self {
        Self {
            etag: etag.into(),
            bindings,
        }
    }

    /// An empty policy carrying the given ETag.
    pub fn empty(etag: impl Into<String>) -> Self {
        Self::new(etag, Vec::new())
    }

    /// Flatten the bindings into a role map.
    ///
    /// Repeated roles are merged and members are deduplicated by ID; the last
    /// occurrence of a member ID decides its type.
    pub fn to_map(&self) -> RoleMap {
        let mut map = RoleMap::new();
        for binding in &self.bindings {
            let members = map.entry(binding.role_id.clone()).or_default();
            for member in &binding.members {
                members.insert(member.member_id.clone(), member.member_type);
            }
        }
        map
    }

    /// Rebuild a policy from a role map.
    ///
    /// Bindings come out sorted by role ID and members by member ID. Roles with
    /// no members are dropped.
    pub fn from_map(etag: impl Into<String>, map: &RoleMap) -> Self {
        let bindings = map
            .iter()
            .filter(|(_, members)| !members.is_empty())
            .map(|(role_id, members)| Binding {
                role_id: role_id.clone(),
                members: members
                    .iter()
                    .map(|(member_id, member_type)| Member {
                        member_id: member_id.clone(),
                        member_type: *member_type,
                    })
                    .collect(),
            })
            .collect();
        Self::new(etag, bindings)
    }

    /// Semantic equality: same (role, member) pairs regardless of order.
    ///
    /// The ETag is not compared.
    pub fn equivalent(&self, other: &Policy) -> bool {
        normalized(self) == normalized(other)
    }

    /// Whether `member_id` currently holds `role_id`.
    pub fn has_member(&self, role_id: &str, member_id: &str) -> bool {
        self.bindings
            .iter()
            .filter(|b| b.role_id == role_id)
            .any(|b| b.members.iter().any(|m| m.member_id == member_id))
    }

    /// Distinct principal IDs referenced anywhere in the policy.
    pub fn principal_ids(&self) -> BTreeSet<&str> {
        self.bindings
            .iter()
            .flat_map(|b| b.members.iter().map(|m| m.member_id.as_str()))
            .collect()
    }
}

fn normalized(policy: &Policy) -> RoleMap {
    let mut map = policy.to_map();
    map.retain(|_, members| !members.is_empty());
    map
}
