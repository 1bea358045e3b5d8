//! User synchronizer tests against the in-memory store and a static
//! directory.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use teamsync_core::{
    AuditAction, AuditRecord, CorrelationId, DEFAULT_ROLES, NewUser, Principal, RoleAssignment,
    RoleName, User,
};
use teamsync_db_memory::MemoryStore;
use teamsync_storage::{DynStore, StorageError, Store, StoreTransaction};
use teamsync_usersync::{
    Directory, DirectoryError, DirectoryPage, DirectorySnapshot, DirectoryUser, GroupMember,
    MemberKind, MemberStatus, RunHistory, RunStatus, StaticDirectory, UserSyncConfig,
    UserSyncError, UserSyncTrigger, UserSynchronizer,
};
use tokio_util::sync::CancellationToken;

// =============================================================================
// Test Infrastructure
// =============================================================================

const DOMAIN: &str = "example.com";
const ADMIN_GROUP: &str = "teamsync-admins@example.com";

fn remote(id: &str, email: &str, name: &str) -> DirectoryUser {
    DirectoryUser {
        id: id.into(),
        primary_email: email.into(),
        name: name.into(),
        suspended: false,
        deleted: false,
    }
}

fn member(id: &str, email: &str) -> GroupMember {
    GroupMember {
        id: id.into(),
        email: email.into(),
        kind: MemberKind::User,
        status: MemberStatus::Active,
    }
}

fn snapshot(users: Vec<DirectoryUser>, admins: Option<Vec<GroupMember>>) -> DirectorySnapshot {
    let mut groups = BTreeMap::new();
    if let Some(admins) = admins {
        groups.insert(ADMIN_GROUP.to_string(), admins);
    }
    DirectorySnapshot { users, groups }
}

/// Serves users from a snapshot but fails every group lookup.
struct BrokenGroups(StaticDirectory);

#[async_trait]
impl Directory for BrokenGroups {
    async fn list_users(
        &self,
        ctx: &CancellationToken,
        domain: &str,
        page_token: Option<&str>,
    ) -> Result<DirectoryPage<DirectoryUser>, DirectoryError> {
        self.0.list_users(ctx, domain, page_token).await
    }

    async fn list_group_members(
        &self,
        _ctx: &CancellationToken,
        _group_email: &str,
        _page_token: Option<&str>,
    ) -> Result<DirectoryPage<GroupMember>, DirectoryError> {
        Err(DirectoryError::unavailable("503 from directory"))
    }
}

/// Never answers.
struct HangingDirectory;

#[async_trait]
impl Directory for HangingDirectory {
    async fn list_users(
        &self,
        ctx: &CancellationToken,
        _domain: &str,
        _page_token: Option<&str>,
    ) -> Result<DirectoryPage<DirectoryUser>, DirectoryError> {
        ctx.cancelled().await;
        Err(DirectoryError::Cancelled)
    }

    async fn list_group_members(
        &self,
        _ctx: &CancellationToken,
        _group_email: &str,
        _page_token: Option<&str>,
    ) -> Result<DirectoryPage<GroupMember>, DirectoryError> {
        Ok(DirectoryPage {
            items: Vec::new(),
            next_page_token: None,
        })
    }
}

/// Memory store whose audit appends are slow.
struct SlowAudits {
    inner: MemoryStore,
    delay: Duration,
}

#[async_trait]
impl Store for SlowAudits {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StorageError> {
        self.inner.begin().await
    }

    fn backend_name(&self) -> &'static str {
        "slow-audits"
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<(), StorageError> {
        tokio::time::sleep(self.delay).await;
        self.inner.append_audit(record).await
    }
}

struct Harness {
    store: DynStore,
    history: Arc<RunHistory>,
}

impl Harness {
    fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            history: Arc::new(RunHistory::default()),
        }
    }

    fn synchronizer(&self, directory: impl Directory + 'static) -> UserSynchronizer {
        UserSynchronizer::new(
            self.store.clone(),
            Arc::new(directory),
            UserSyncConfig::new(DOMAIN),
            self.history.clone(),
        )
    }

    fn static_sync(&self, snapshot: DirectorySnapshot) -> UserSynchronizer {
        self.synchronizer(StaticDirectory::new(snapshot).with_page_size(2))
    }

    async fn seed_user(&self, email: &str, external_id: &str) -> User {
        let user = NewUser {
            email: email.into(),
            name: email.into(),
            external_id: external_id.into(),
        };
        self.store
            .transaction(move |tx| Box::pin(async move { tx.create_user(&user).await }))
            .await
            .unwrap()
    }

    async fn grant(&self, user: &User, role: RoleName) {
        let assignment = RoleAssignment::global(Principal::User(user.id), role);
        self.store
            .transaction(move |tx| Box::pin(async move { tx.assign_role(&assignment).await }))
            .await
            .unwrap();
    }

    async fn users(&self) -> Vec<User> {
        let mut users = self
            .store
            .transaction(|tx| Box::pin(async move { tx.list_users().await }))
            .await
            .unwrap();
        users.sort_by(|a, b| a.email.cmp(&b.email));
        users
    }

    async fn user(&self, email: &str) -> Option<User> {
        let email = email.to_string();
        self.store
            .transaction(move |tx| Box::pin(async move { tx.get_user_by_email(&email).await }))
            .await
            .unwrap()
    }

    async fn global_roles(&self, user: &User) -> Vec<RoleName> {
        let principal = Principal::User(user.id);
        let mut roles: Vec<RoleName> = self
            .store
            .transaction(move |tx| {
                Box::pin(async move { tx.list_roles_for_principal(&principal).await })
            })
            .await
            .unwrap()
            .into_iter()
            .filter(RoleAssignment::is_global)
            .map(|a| a.role)
            .collect();
        roles.sort();
        roles
    }

    async fn audits(&self, cid: CorrelationId) -> Vec<AuditRecord> {
        self.store.audit_by_correlation(&cid).await.unwrap()
    }
}

fn actions(records: &[AuditRecord]) -> Vec<&str> {
    records.iter().map(|r| r.action.as_str()).collect()
}

fn with_defaults(extra: &[RoleName]) -> Vec<RoleName> {
    let mut roles: Vec<RoleName> = DEFAULT_ROLES.iter().chain(extra).copied().collect();
    roles.sort();
    roles
}

// =============================================================================
// Import
// =============================================================================

#[tokio::test]
async fn test_fresh_import_creates_users_with_default_roles() {
    let h = Harness::new();
    let sync = h.static_sync(snapshot(
        vec![
            remote("1", "Alice@Example.com", "Alice"),
            remote("2", "bob@example.com", "Bob"),
            remote("3", "carol@example.com", "Carol"),
        ],
        Some(Vec::new()),
    ));
    let cid = CorrelationId::new();

    let summary = sync.sync(&CancellationToken::new(), cid).await.unwrap();
    assert_eq!(summary.created, 3);
    assert_eq!(summary.updated + summary.deleted, 0);

    let users = h.users().await;
    let emails: Vec<&str> = users.iter().map(|u| u.email.as_str()).collect();
    assert_eq!(
        emails,
        vec!["alice@example.com", "bob@example.com", "carol@example.com"]
    );
    assert_eq!(users[0].external_id, "1");
    for user in &users {
        assert_eq!(h.global_roles(user).await, with_defaults(&[]));
    }

    let records = h.audits(cid).await;
    assert_eq!(actions(&records), vec!["usersync:create"; 3]);
}

#[tokio::test]
async fn test_second_run_without_changes_is_silent() {
    let h = Harness::new();
    let sync = h.static_sync(snapshot(
        vec![remote("1", "alice@example.com", "Alice")],
        Some(vec![member("1", "alice@example.com")]),
    ));
    sync.sync(&CancellationToken::new(), CorrelationId::new())
        .await
        .unwrap();

    let cid = CorrelationId::new();
    let summary = sync.sync(&CancellationToken::new(), cid).await.unwrap();
    assert_eq!(summary, Default::default());
    assert!(h.audits(cid).await.is_empty());
}

#[tokio::test]
async fn test_user_missing_from_directory_is_deleted() {
    let h = Harness::new();
    h.seed_user("a@example.com", "1").await;
    h.seed_user("b@example.com", "2").await;
    let c = h.seed_user("c@example.com", "3").await;
    h.grant(&c, RoleName::Admin).await;

    let sync = h.static_sync(snapshot(
        vec![
            remote("1", "a@example.com", "a@example.com"),
            remote("2", "b@example.com", "b@example.com"),
        ],
        None,
    ));
    let cid = CorrelationId::new();
    let summary = sync.sync(&CancellationToken::new(), cid).await.unwrap();

    assert_eq!(summary.deleted, 1);
    assert!(h.user("c@example.com").await.is_none());
    assert_eq!(h.users().await.len(), 2);

    // The admin grant went away with the user, not through a revocation.
    let records = h.audits(cid).await;
    assert_eq!(actions(&records), vec!["usersync:delete"]);
    assert!(records[0].message.contains("c@example.com"));
}

#[tokio::test]
async fn test_renamed_user_is_matched_by_external_id() {
    let h = Harness::new();
    let before = h.seed_user("old@example.com", "42").await;

    let sync = h.static_sync(snapshot(
        vec![remote("42", "new@example.com", "Renamed")],
        None,
    ));
    let cid = CorrelationId::new();
    let summary = sync.sync(&CancellationToken::new(), cid).await.unwrap();
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.created, 0);

    let after = h.user("new@example.com").await.unwrap();
    assert_eq!(after.id, before.id);
    assert_eq!(after.name, "Renamed");
    assert!(h.user("old@example.com").await.is_none());
    assert_eq!(actions(&h.audits(cid).await), vec!["usersync:update"]);
}

#[tokio::test]
async fn test_legacy_user_is_adopted_by_email() {
    let h = Harness::new();
    let before = h.seed_user("legacy@example.com", "").await;

    let sync = h.static_sync(snapshot(
        vec![remote("77", "legacy@example.com", "Legacy")],
        None,
    ));
    sync.sync(&CancellationToken::new(), CorrelationId::new())
        .await
        .unwrap();

    let after = h.user("legacy@example.com").await.unwrap();
    assert_eq!(after.id, before.id);
    assert_eq!(after.external_id, "77");
}

#[tokio::test]
async fn test_reassigned_address_rekeys_local_user() {
    let h = Harness::new();
    let departed = h.seed_user("shared@example.com", "old-id").await;

    // The directory reissued the address under a new id.
    let sync = h.static_sync(snapshot(
        vec![remote("new-id", "shared@example.com", "Newcomer")],
        None,
    ));
    sync.sync(&CancellationToken::new(), CorrelationId::new())
        .await
        .unwrap();

    let users = h.users().await;
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].id, departed.id);
    assert_eq!(users[0].external_id, "new-id");
}

// =============================================================================
// Admin role
// =============================================================================

#[tokio::test]
async fn test_admin_group_members_get_admin_role() {
    let h = Harness::new();
    let sync = h.static_sync(snapshot(
        vec![
            remote("1", "alice@example.com", "Alice"),
            remote("2", "bob@example.com", "Bob"),
        ],
        Some(vec![
            member("1", "alice@example.com"),
            member("999", "stranger@example.com"),
            GroupMember {
                kind: MemberKind::Group,
                ..member("2", "bob@example.com")
            },
        ]),
    ));
    let cid = CorrelationId::new();
    let summary = sync.sync(&CancellationToken::new(), cid).await.unwrap();
    assert_eq!(summary.admins_granted, 1);

    let alice = h.user("alice@example.com").await.unwrap();
    let bob = h.user("bob@example.com").await.unwrap();
    assert_eq!(h.global_roles(&alice).await, with_defaults(&[RoleName::Admin]));
    assert_eq!(h.global_roles(&bob).await, with_defaults(&[]));

    let records = h.audits(cid).await;
    let grants: Vec<&AuditRecord> = records
        .iter()
        .filter(|r| r.action == AuditAction::USERSYNC_ASSIGN_ADMIN)
        .collect();
    assert_eq!(grants.len(), 1);
    assert!(grants[0].message.contains("alice@example.com"));
}

#[tokio::test]
async fn test_missing_admin_group_revokes_admin_once() {
    let h = Harness::new();
    let alice = h.seed_user("alice@example.com", "1").await;
    h.grant(&alice, RoleName::Admin).await;

    let sync = h.static_sync(snapshot(vec![remote("1", "alice@example.com", "alice@example.com")], None));
    let cid = CorrelationId::new();
    let summary = sync.sync(&CancellationToken::new(), cid).await.unwrap();
    assert_eq!(summary.admins_revoked, 1);

    let roles = h.global_roles(&alice).await;
    assert!(!roles.contains(&RoleName::Admin));
    assert_eq!(roles, with_defaults(&[]));

    let records = h.audits(cid).await;
    assert_eq!(actions(&records), vec!["usersync:revoke-admin"]);
    assert!(records[0].message.contains("alice@example.com"));
}

#[tokio::test]
async fn test_team_scoped_admin_is_left_alone() {
    let h = Harness::new();
    let alice = h.seed_user("alice@example.com", "1").await;
    let scoped = RoleAssignment::for_team(
        Principal::User(alice.id),
        RoleName::Admin,
        teamsync_core::Slug::parse("alpha").unwrap(),
    );
    let assignment = scoped.clone();
    h.store
        .transaction(move |tx| Box::pin(async move { tx.assign_role(&assignment).await }))
        .await
        .unwrap();

    let sync = h.static_sync(snapshot(vec![remote("1", "alice@example.com", "alice@example.com")], None));
    let summary = sync
        .sync(&CancellationToken::new(), CorrelationId::new())
        .await
        .unwrap();
    assert_eq!(summary.admins_revoked, 0);

    let principal = Principal::User(alice.id);
    let all = h
        .store
        .transaction(move |tx| {
            Box::pin(async move { tx.list_roles_for_principal(&principal).await })
        })
        .await
        .unwrap();
    assert!(all.contains(&scoped));
}

// =============================================================================
// Failure handling
// =============================================================================

#[tokio::test]
async fn test_directory_failure_rolls_back_everything() {
    let h = Harness::new();
    let existing = h.seed_user("old@example.com", "1").await;
    h.grant(&existing, RoleName::Admin).await;

    let sync = h.synchronizer(BrokenGroups(StaticDirectory::new(snapshot(
        vec![remote("2", "new@example.com", "New")],
        None,
    ))));
    let cid = CorrelationId::new();
    let err = sync.sync(&CancellationToken::new(), cid).await.unwrap_err();
    assert!(matches!(err, UserSyncError::Directory(_)));

    // The delete of the old user and the create of the new one were undone.
    let users = h.users().await;
    assert_eq!(users, vec![existing.clone()]);
    assert!(h.global_roles(&existing).await.contains(&RoleName::Admin));
    assert!(h.audits(cid).await.is_empty());

    let runs = h.history.runs();
    assert_eq!(runs[0].status(), RunStatus::Failure);
    assert!(runs[0].error().unwrap().contains("503"));
}

#[tokio::test]
async fn test_timeout_fails_the_run() {
    let h = Harness::new();
    let sync = UserSynchronizer::new(
        h.store.clone(),
        Arc::new(HangingDirectory),
        UserSyncConfig::new(DOMAIN).with_timeout(Duration::from_millis(50)),
        h.history.clone(),
    );

    let err = sync
        .sync(&CancellationToken::new(), CorrelationId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, UserSyncError::Timeout(_)));
    assert_eq!(h.history.runs()[0].status(), RunStatus::Failure);
}

#[tokio::test]
async fn test_audits_after_commit_are_outside_the_time_budget() {
    let h = Harness {
        store: Arc::new(SlowAudits {
            inner: MemoryStore::new(),
            delay: Duration::from_millis(60),
        }),
        history: Arc::new(RunHistory::default()),
    };
    let sync = UserSynchronizer::new(
        h.store.clone(),
        Arc::new(StaticDirectory::new(snapshot(
            vec![
                remote("1", "alice@example.com", "Alice"),
                remote("2", "bob@example.com", "Bob"),
                remote("3", "carol@example.com", "Carol"),
            ],
            Some(Vec::new()),
        ))),
        UserSyncConfig::new(DOMAIN).with_timeout(Duration::from_millis(100)),
        h.history.clone(),
    );
    let cid = CorrelationId::new();

    let summary = sync.sync(&CancellationToken::new(), cid).await.unwrap();
    assert_eq!(summary.created, 3);
    assert_eq!(h.history.runs()[0].status(), RunStatus::Success);
    assert_eq!(actions(&h.audits(cid).await), vec!["usersync:create"; 3]);
}

#[tokio::test]
async fn test_storage_conflict_surfaces_as_storage_error() {
    let h = Harness::new();
    // Two local users swapping addresses cannot be applied one update at a time.
    h.seed_user("a@example.com", "1").await;
    h.seed_user("b@example.com", "2").await;

    let sync = h.static_sync(snapshot(
        vec![
            remote("1", "b@example.com", "A"),
            remote("2", "a@example.com", "B"),
        ],
        None,
    ));
    let err = sync
        .sync(&CancellationToken::new(), CorrelationId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, UserSyncError::Storage(StorageError::AlreadyExists { .. })));
    assert_eq!(h.users().await[0].external_id, "1");
}

// =============================================================================
// History and trigger
// =============================================================================

#[tokio::test]
async fn test_history_keeps_latest_runs() {
    let h = Harness::new();
    let sync = h.static_sync(snapshot(Vec::new(), None));

    let mut cids = Vec::new();
    for _ in 0..7 {
        let cid = CorrelationId::new();
        sync.sync(&CancellationToken::new(), cid).await.unwrap();
        cids.push(cid);
    }

    let runs = sync.history().runs();
    assert_eq!(runs.len(), 5);
    assert_eq!(runs[0].correlation_id(), cids[6]);
    assert_eq!(runs[4].correlation_id(), cids[2]);
    assert!(runs.iter().all(|r| r.status() == RunStatus::Success));
}

#[tokio::test]
async fn test_run_loop_consumes_triggers_until_cancelled() {
    let h = Harness::new();
    let sync = Arc::new(h.static_sync(snapshot(
        vec![remote("1", "alice@example.com", "Alice")],
        None,
    )));
    let (trigger, rx) = UserSyncTrigger::channel();
    let ctx = CancellationToken::new();

    let handle = {
        let sync = sync.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { sync.run(ctx, rx).await })
    };

    let cid = CorrelationId::new();
    assert!(trigger.trigger(cid));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.user("alice@example.com").await.is_none() {
        assert!(tokio::time::Instant::now() < deadline, "sync never ran");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    ctx.cancel();
    handle.await.unwrap();
    assert_eq!(h.history.runs()[0].correlation_id(), cid);
}
