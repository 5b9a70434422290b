//! Single-flight policy futures and the reconciliation loop.
//!
//! A [`PolicyFuture`] stands for one pending read, or one pending
//! read-modify-write, of a resource's IAM policy. Callers that arrive during
//! the batching window share the same future; the batcher completes it once
//! and every waiter sees the same outcome.
//!
//! Write futures queue setters and removers until their reconciliation
//! starts. At that point the queue is taken and the future is sealed, so a
//! late caller can never attach a mutation that would be silently skipped.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::IamConfig;
use crate::error::IamError;
use crate::model::{Binding, Policy};
use crate::resolver::PrincipalResolver;
use crate::updater::ResourceIamUpdater;
use crate::validation::validate_mutations;

/// One caller's requested change: a binding to add and/or a binding to remove.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mutation {
    /// Binding to add.
    pub setter: Option<Binding>,
    /// Binding to remove.
    pub remover: Option<Binding>,
}

impl Mutation {
    /// Create a mutation.
    pub fn new(setter: Option<Binding>, remover: Option<Binding>) -> Self {
        Self { setter, remover }
    }

    /// Add `binding`.
    pub fn set(binding: Binding) -> Self {
        Self::new(Some(binding), None)
    }

    /// Remove `binding`.
    pub fn remove(binding: Binding) -> Self {
        Self::new(None, Some(binding))
    }
}

/// Whether a future reads the policy or rewrites it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureKind {
    /// Read-only fetch.
    Read,
    /// Batched read-modify-write.
    Write,
}

#[derive(Debug, Default)]
struct PendingMutations {
    setters: Vec<Binding>,
    removers: Vec<Binding>,
    sealed: bool,
}

type Outcome = Option<Result<Policy, IamError>>;

/// The eventual result of one batched policy operation.
#[derive(Debug)]
pub struct PolicyFuture {
    kind: FutureKind,
    pending: Mutex<PendingMutations>,
    outcome: watch::Sender<Outcome>,
}

impl PolicyFuture {
    fn new(kind: FutureKind) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            kind,
            pending: Mutex::new(PendingMutations::default()),
            outcome,
        }
    }

    /// A future for a read-only fetch.
    pub fn read() -> Self {
        Self::new(FutureKind::Read)
    }

    /// A write future seeded with its first mutation.
    pub fn write(initial: Mutation) -> Self {
        let future = Self::new(FutureKind::Write);
        future.pending.lock().push(initial);
        future
    }

    /// Which operation this future performs.
    pub fn kind(&self) -> FutureKind {
        self.kind
    }

    /// Whether the result is available.
    pub fn is_completed(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Whether the queued mutations have been taken for execution.
    pub fn is_sealed(&self) -> bool {
        self.pending.lock().sealed
    }

    /// Number of queued setters and removers.
    pub fn pending_mutations(&self) -> (usize, usize) {
        let pending = self.pending.lock();
        (pending.setters.len(), pending.removers.len())
    }

    /// Queue another caller's mutation.
    ///
    /// Fails, handing the mutation back, once the future has been sealed.
    pub fn add_mutation(&self, mutation: Mutation) -> Result<(), Mutation> {
        let mut pending = self.pending.lock();
        if pending.sealed || self.kind == FutureKind::Read {
            return Err(mutation);
        }
        pending.push(mutation);
        Ok(())
    }

    /// Wait for the result.
    ///
    /// Any number of callers may wait concurrently; each gets a clone of the
    /// same outcome.
    pub async fn wait(&self) -> Result<Policy, IamError> {
        let mut receiver = self.outcome.subscribe();
        let result = match receiver.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone().unwrap_or_else(|| Err(abandoned())),
            Err(_) => Err(abandoned()),
        };
        result
    }

    /// Store the result and wake every waiter.
    ///
    /// Only the first call has an effect; returns whether this call stored it.
    pub fn complete(&self, result: Result<Policy, IamError>) -> bool {
        let stored = self.outcome.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        });
        if !stored {
            warn!(kind = ?self.kind, "Ignoring second completion of a policy future");
        }
        stored
    }

    pub(crate) fn seal(&self) -> (Vec<Binding>, Vec<Binding>) {
        let mut pending = self.pending.lock();
        pending.sealed = true;
        (
            std::mem::take(&mut pending.setters),
            std::mem::take(&mut pending.removers),
        )
    }

    /// Run the read this future stands for and complete it.
    pub(crate) async fn execute_read(&self, updater: Arc<dyn ResourceIamUpdater>) {
        self.pending.lock().sealed = true;
        let result = updater
            .get_resource_iam_policy()
            .await
            .map_err(IamError::into_fetch);
        match &result {
            Ok(policy) => debug!(etag = %policy.etag, bindings = policy.bindings.len(), "Fetched IAM policy"),
            Err(e) => warn!(error = %e, "Fetching IAM policy failed"),
        }
        self.complete(result);
    }

    /// Run the reconciliation this future stands for and complete it.
    pub(crate) async fn execute_write(
        &self,
        updater: Arc<dyn ResourceIamUpdater>,
        resolver: PrincipalResolver,
        config: IamConfig,
    ) {
        let (setters, removers) = self.seal();
        let result = reconcile(updater.as_ref(), &resolver, &config, &setters, &removers).await;
        if let Err(e) = &result {
            warn!(resource = %updater.describe(), error = %e, "Batched IAM policy update failed");
        }
        self.complete(result);
    }
}

impl PendingMutations {
    fn push(&mut self, mutation: Mutation) {
        self.setters.extend(mutation.setter);
        self.removers.extend(mutation.remover);
    }
}

fn abandoned() -> IamError {
    IamError::Write("policy operation was abandoned before completing".to_string())
}

/// Read-modify-write `updater`'s policy with all queued setters and removers.
///
/// Removers are applied before setters, so a pair that is both removed and
/// added in one batch ends up present. Conflicting writes are retried after a
/// doubling backoff until the backoff would exceed `config.max_backoff`.
pub async fn reconcile(
    updater: &dyn ResourceIamUpdater,
    resolver: &PrincipalResolver,
    config: &IamConfig,
    setters: &[Binding],
    removers: &[Binding],
) -> Result<Policy, IamError> {
    validate_mutations(setters, removers)?;

    let principal_ids: Vec<String> = setters
        .iter()
        .flat_map(|b| b.members.iter().map(|m| m.member_id.clone()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut backoff = config.initial_backoff;
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let current = updater
            .get_resource_iam_policy()
            .await
            .map_err(IamError::into_fetch)?;
        let member_types = resolver.resolve_types(&principal_ids).await?;

        let mut roles = current.to_map();
        for remover in removers {
            for member in &remover.members {
                if let Some(members) = roles.get_mut(&remover.role_id) {
                    members.remove(&member.member_id);
                    if members.is_empty() {
                        roles.remove(&remover.role_id);
                    }
                }
            }
        }
        for setter in setters {
            let members = roles.entry(setter.role_id.clone()).or_default();
            for member in &setter.members {
                members.insert(
                    member.member_id.clone(),
                    member_types.get(&member.member_id).copied(),
                );
            }
        }

        let desired = Policy::from_map(current.etag.clone(), &roles);
        info!(
            resource = %updater.describe(),
            attempt,
            setters = setters.len(),
            removers = removers.len(),
            etag = %desired.etag,
            "Writing batched IAM policy"
        );

        match updater.set_resource_iam_policy(desired).await {
            Ok(policy) => return Ok(policy),
            Err(err) if err.is_conflict() => {
                if backoff > config.max_backoff {
                    warn!(attempt, error = %err, "Giving up on conflicting IAM policy update");
                    return Err(err);
                }
                warn!(
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "IAM policy changed concurrently, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            },
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Member, MemberType};
    use crate::resolver::PrincipalType;
    use crate::testing::{InMemoryIamClient, StaticDirectory};
    use crate::updater::HcpResourceIamUpdater;
    use std::time::Duration;
    use tokio::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    struct Fixture {
        client: Arc<InMemoryIamClient>,
        directory: Arc<StaticDirectory>,
        updater: Arc<dyn ResourceIamUpdater>,
        resolver: PrincipalResolver,
    }

    fn fixture(initial: Policy) -> Fixture {
        let client = Arc::new(InMemoryIamClient::new());
        client.insert("project/p1", initial);
        let directory = Arc::new(
            StaticDirectory::new()
                .with_principal("user:a", PrincipalType::User)
                .with_principal("user:b", PrincipalType::User)
                .with_principal("group:g", PrincipalType::Group),
        );
        let updater: Arc<dyn ResourceIamUpdater> =
            Arc::new(HcpResourceIamUpdater::project("p1", client.clone()));
        let resolver = PrincipalResolver::new(directory.clone());
        Fixture {
            client,
            directory,
            updater,
            resolver,
        }
    }

    #[tokio::test]
    async fn test_future_broadcasts_single_outcome() {
        let future = Arc::new(PolicyFuture::read());
        assert!(!future.is_completed());

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let future = future.clone();
                tokio::spawn(async move { future.wait().await })
            })
            .collect();

        assert!(future.complete(Ok(Policy::empty("e1"))));
        assert!(!future.complete(Err(IamError::Fetch("late".to_string()))));
        assert!(future.is_completed());

        for waiter in waiters {
            let policy = waiter.await.unwrap().unwrap();
            assert_eq!(policy.etag, "e1");
        }
        // Waiting after completion returns immediately
        assert_eq!(future.wait().await.unwrap().etag, "e1");
    }

    #[test]
    fn test_add_mutation_rejected_after_seal() {
        let future = PolicyFuture::write(Mutation::set(Binding::single("roles/viewer", "u1")));
        assert_ok!(future.add_mutation(Mutation::remove(Binding::single("roles/viewer", "u2"))));
        assert_eq!(future.pending_mutations(), (1, 1));

        let (setters, removers) = future.seal();
        assert_eq!((setters.len(), removers.len()), (1, 1));
        assert!(future.is_sealed());

        let late = Mutation::set(Binding::single("roles/admin", "u3"));
        let returned = assert_err!(future.add_mutation(late.clone()));
        assert_eq!(returned, late);
    }

    #[test]
    fn test_read_future_rejects_mutations() {
        let future = PolicyFuture::read();
        assert!(future
            .add_mutation(Mutation::set(Binding::single("roles/viewer", "u1")))
            .is_err());
    }

    #[tokio::test]
    async fn test_reconcile_example_scenario() {
        let f = fixture(Policy::empty("e1"));
        let removers = vec![Binding::single("roles/viewer", "user:a")];
        let setters = vec![Binding::single("roles/viewer", "user:b")];

        let written = assert_ok!(
            reconcile(
                f.updater.as_ref(),
                &f.resolver,
                &IamConfig::default(),
                &setters,
                &removers
            )
            .await
        );

        let submitted = &f.client.written()[0];
        assert_eq!(submitted.etag, "e1");
        assert_eq!(
            submitted.bindings,
            vec![Binding::new(
                "roles/viewer",
                vec![Member::new("user:b", MemberType::User)]
            )]
        );
        assert!(written.equivalent(submitted));
        assert_eq!(f.directory.requests(), vec![vec!["user:b".to_string()]]);
    }

    #[tokio::test]
    async fn test_reconcile_removers_before_setters() {
        let f = fixture(Policy::new(
            "e1",
            vec![Binding::new(
                "roles/viewer",
                vec![
                    Member::new("user:a", MemberType::User),
                    Member::new("group:g", MemberType::Group),
                ],
            )],
        ));
        // Setter listed first, remover for the same pair listed second.
        let setters = vec![Binding::single("roles/viewer", "user:a")];
        let removers = vec![
            Binding::single("roles/viewer", "user:a"),
            Binding::single("roles/viewer", "group:g"),
        ];

        let written = reconcile(
            f.updater.as_ref(),
            &f.resolver,
            &IamConfig::default(),
            &setters,
            &removers,
        )
        .await
        .unwrap();

        assert!(written.has_member("roles/viewer", "user:a"));
        assert!(!written.has_member("roles/viewer", "group:g"));
    }

    #[tokio::test]
    async fn test_reconcile_drops_emptied_roles() {
        let f = fixture(Policy::new(
            "e1",
            vec![Binding::new(
                "roles/admin",
                vec![Member::new("user:a", MemberType::User)],
            )],
        ));
        let removers = vec![
            Binding::single("roles/admin", "user:a"),
            Binding::single("roles/missing", "user:a"),
        ];

        let written = reconcile(
            f.updater.as_ref(),
            &f.resolver,
            &IamConfig::default(),
            &[],
            &removers,
        )
        .await
        .unwrap();

        assert!(written.bindings.is_empty());
        assert_eq!(f.directory.calls(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_validation_makes_no_remote_calls() {
        let f = fixture(Policy::empty("e1"));
        let setters = vec![Binding::single("", "user:a")];

        let err = reconcile(
            f.updater.as_ref(),
            &f.resolver,
            &IamConfig::default(),
            &setters,
            &[],
        )
        .await
        .unwrap_err();

        assert!(matches!(err, IamError::Validation(_)));
        assert_eq!(f.client.get_calls(), 0);
        assert_eq!(f.client.set_calls(), 0);
        assert_eq!(f.directory.calls(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_fetch_and_resolution_errors_stop() {
        let f = fixture(Policy::empty("e1"));
        f.client
            .fail_next_gets([IamError::Write("backend unavailable".to_string())]);
        let setters = vec![Binding::single("roles/viewer", "user:a")];

        let err = reconcile(f.updater.as_ref(), &f.resolver, &IamConfig::default(), &setters, &[])
            .await
            .unwrap_err();
        assert_eq!(err, IamError::Fetch("backend unavailable".to_string()));
        assert_eq!(f.client.set_calls(), 0);

        let unknown = vec![Binding::single("roles/viewer", "user:nobody")];
        let err = reconcile(f.updater.as_ref(), &f.resolver, &IamConfig::default(), &unknown, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, IamError::Resolution(_)));
        assert_eq!(f.client.set_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_retries_conflict_then_succeeds() {
        let f = fixture(Policy::empty("e1"));
        f.client.fail_next_sets([
            IamError::Conflict("stale".to_string()),
            IamError::Conflict("stale".to_string()),
        ]);
        let setters = vec![Binding::single("roles/viewer", "user:a")];
        let start = Instant::now();

        let written = reconcile(f.updater.as_ref(), &f.resolver, &IamConfig::default(), &setters, &[])
            .await
            .unwrap();

        assert!(written.has_member("roles/viewer", "user:a"));
        assert_eq!(f.client.set_calls(), 3);
        assert_eq!(f.client.get_calls(), 3);
        // 1s + 2s of backoff
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_conflict_retry_bound() {
        let f = fixture(Policy::empty("e1"));
        f.client.fail_all_sets(IamError::Conflict("always stale".to_string()));
        let setters = vec![Binding::single("roles/viewer", "user:a")];
        let start = Instant::now();

        let err = reconcile(f.updater.as_ref(), &f.resolver, &IamConfig::default(), &setters, &[])
            .await
            .unwrap_err();

        assert!(err.is_conflict());
        assert_eq!(f.client.set_calls(), 6);
        // Slept 1 + 2 + 4 + 8 + 16 before the 32s backoff was refused
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(31) && elapsed < Duration::from_secs(32));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_backoff_saturates_instead_of_overflowing() {
        let f = fixture(Policy::empty("e1"));
        f.client.fail_all_sets(IamError::Conflict("always stale".to_string()));
        let setters = vec![Binding::single("roles/viewer", "user:a")];
        let config = IamConfig {
            batch_delay: Duration::ZERO,
            initial_backoff: Duration::from_secs(u64::MAX),
            max_backoff: Duration::from_secs(u64::MAX),
        };

        let err = reconcile(f.updater.as_ref(), &f.resolver, &config, &setters, &[])
            .await
            .unwrap_err();

        assert!(err.is_conflict());
        assert_eq!(f.client.set_calls(), 2);
    }

    #[tokio::test]
    async fn test_reconcile_other_write_errors_not_retried() {
        let f = fixture(Policy::empty("e1"));
        f.client
            .fail_next_sets([IamError::PermissionDenied("nope".to_string())]);
        let setters = vec![Binding::single("roles/viewer", "user:a")];

        let err = reconcile(f.updater.as_ref(), &f.resolver, &IamConfig::default(), &setters, &[])
            .await
            .unwrap_err();

        assert_eq!(err, IamError::PermissionDenied("nope".to_string()));
        assert_eq!(f.client.set_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_submits_fetched_etag_on_every_attempt() {
        let f = fixture(Policy::empty("e1"));
        f.client.touch("project/p1");
        f.client.fail_next_sets([IamError::Conflict("stale".to_string())]);
        let setters = vec![Binding::single("roles/viewer", "user:a")];

        reconcile(f.updater.as_ref(), &f.resolver, &IamConfig::default(), &setters, &[])
            .await
            .unwrap();

        let written = f.client.written();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0].etag, written[1].etag);
        assert_eq!(written[1].etag, "etag-1");
    }
}
