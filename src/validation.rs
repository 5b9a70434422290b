//! Validation helpers for mutation requests and policy documents.
//!
//! Setters and removers handed to [`ResourceBatcher::modify_policy`] must each
//! name exactly one role and exactly one member. Whole policies written by the
//! authoritative policy resource are capped at [`MAX_POLICY_PRINCIPALS`]
//! distinct principals, which also keeps principal lookups within the
//! directory's batch limit.
//!
//! # Example
//!
//! ```
//! use hcp_provider_iam::model::Binding;
//! use hcp_provider_iam::validation::validate_mutation;
//!
//! assert!(validate_mutation(&Binding::single("roles/viewer", "user-1")).is_ok());
//! assert!(validate_mutation(&Binding::single("", "user-1")).is_err());
//! ```
//!
//! [`ResourceBatcher::modify_policy`]: crate::batcher::ResourceBatcher::modify_policy

use crate::error::IamError;
use crate::model::{Binding, Policy};

/// The most distinct principals a single policy may reference.
pub const MAX_POLICY_PRINCIPALS: usize = 1000;

/// Validate a single setter or remover.
pub fn validate_mutation(binding: &Binding) -> Result<(), IamError> {
    if binding.role_id.trim().is_empty() {
        return Err(IamError::Validation(
            "a role must be specified for every binding mutation".to_string(),
        ));
    }
    match binding.members.as_slice() {
        [member] if !member.member_id.trim().is_empty() => Ok(()),
        [_] => Err(IamError::Validation(format!(
            "member ID must not be empty for role {}",
            binding.role_id
        ))),
        members => Err(IamError::Validation(format!(
            "exactly one member must be specified for role {}, got {}",
            binding.role_id,
            members.len()
        ))),
    }
}

/// Validate every queued setter and remover, stopping at the first error.
pub fn validate_mutations(setters: &[Binding], removers: &[Binding]) -> Result<(), IamError> {
    setters
        .iter()
        .chain(removers.iter())
        .try_for_each(validate_mutation)
}

/// Validate a complete policy before writing it.
pub fn validate_policy(policy: &Policy) -> Result<(), IamError> {
    for binding in &policy.bindings {
        if binding.role_id.trim().is_empty() {
            return Err(IamError::Validation(
                "policy bindings must specify a role".to_string(),
            ));
        }
        if binding.members.is_empty() {
            return Err(IamError::Validation(format!(
                "binding for role {} has no members",
                binding.role_id
            )));
        }
        if let Some(blank) = binding
            .members
            .iter()
            .find(|m| m.member_id.trim().is_empty())
        {
            return Err(IamError::Validation(format!(
                "binding for role {} has a member with an empty ID{}",
                binding.role_id,
                blank
                    .member_type
                    .map(|t| format!(" (type {})", t))
                    .unwrap_or_default()
            )));
        }
    }

    let principals = policy.principal_ids().len();
    if principals > MAX_POLICY_PRINCIPALS {
        return Err(IamError::Validation(format!(
            "policy references {} principals, the maximum is {}",
            principals, MAX_POLICY_PRINCIPALS
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Member, MemberType};

    #[test]
    fn test_validate_mutation_ok() {
        assert!(validate_mutation(&Binding::single("roles/viewer", "u1")).is_ok());
    }

    #[test]
    fn test_validate_mutation_blank_role() {
        let err = validate_mutation(&Binding::single("  ", "u1")).unwrap_err();
        assert!(matches!(err, IamError::Validation(_)));
    }

    #[test]
    fn test_validate_mutation_member_count() {
        let none = Binding::new("roles/viewer", vec![]);
        assert!(validate_mutation(&none)
            .unwrap_err()
            .message()
            .contains("got 0"));

        let two = Binding::new(
            "roles/viewer",
            vec![Member::unresolved("u1"), Member::unresolved("u2")],
        );
        assert!(validate_mutation(&two)
            .unwrap_err()
            .message()
            .contains("got 2"));

        let blank = Binding::single("roles/viewer", "");
        assert!(validate_mutation(&blank)
            .unwrap_err()
            .message()
            .contains("must not be empty"));
    }

    #[test]
    fn test_validate_mutations_checks_removers() {
        let setters = vec![Binding::single("roles/viewer", "u1")];
        let removers = vec![Binding::single("", "u2")];
        assert!(validate_mutations(&setters, &[]).is_ok());
        assert!(validate_mutations(&setters, &removers).is_err());
    }

    #[test]
    fn test_validate_policy() {
        let policy = Policy::new(
            "e1",
            vec![Binding::new(
                "roles/viewer",
                vec![Member::new("u1", MemberType::User)],
            )],
        );
        assert!(validate_policy(&policy).is_ok());
        assert!(validate_policy(&Policy::default()).is_ok());

        let empty_members = Policy::new("", vec![Binding::new("roles/viewer", vec![])]);
        assert!(validate_policy(&empty_members).is_err());

        let blank_member = Policy::new(
            "",
            vec![Binding::new("roles/viewer", vec![Member::new("", MemberType::Group)])],
        );
        let err = validate_policy(&blank_member).unwrap_err();
        assert!(err.message().contains("type GROUP"));
    }

    #[test]
    fn test_validate_policy_principal_cap() {
        let members: Vec<_> = (0..=MAX_POLICY_PRINCIPALS)
            .map(|i| Member::new(format!("user-{}", i), MemberType::User))
            .collect();
        let policy = Policy::new("", vec![Binding::new("roles/viewer", members)]);
        let err = validate_policy(&policy).unwrap_err();
        assert!(err.message().contains("1001 principals"));
    }
}
