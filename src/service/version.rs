//! Version log service and rollback
//!
//! The version log is append-only: every rule mutation leaves a row, and the
//! whole rule set can be reconstructed at any historical global version.
//! Rollback replaces the live set with such a snapshot inside one store
//! transaction and records a rollback update event.

use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use crate::error::{WafError, WafResult};
use crate::model::{
    ChangeType, RuleDiff, RuleSyncLog, RuleUpdateEvent, RuleVersion, SyncStatus,
};
use crate::storage::{RuleStore, VersionStore};

pub struct VersionService {
    versions: Arc<dyn VersionStore>,
    rules: Arc<dyn RuleStore>,
}

impl VersionService {
    pub fn new(versions: Arc<dyn VersionStore>, rules: Arc<dyn RuleStore>) -> Self {
        Self { versions, rules }
    }

    pub async fn create_version(&self, version: RuleVersion) -> WafResult<()> {
        self.versions.create_version(version).await
    }

    pub async fn get_version(&self, rule_id: i64, version: i64) -> WafResult<Option<RuleVersion>> {
        self.versions.get_version(rule_id, version).await
    }

    pub async fn list_versions(&self, rule_id: i64) -> WafResult<Vec<RuleVersion>> {
        self.versions.list_versions(rule_id).await
    }

    pub async fn get_sync_logs(&self, rule_id: i64) -> WafResult<Vec<RuleSyncLog>> {
        self.versions.list_sync_logs(rule_id).await
    }

    pub async fn record_sync_log(&self, log: RuleSyncLog) -> WafResult<()> {
        self.versions.create_sync_log(log).await
    }

    pub async fn list_update_events(&self) -> WafResult<Vec<RuleUpdateEvent>> {
        self.versions.list_update_events().await
    }

    /// Record an externally produced update event: one version row and one
    /// sync log per diff.
    pub async fn sync_rules(&self, event: &RuleUpdateEvent) -> WafResult<()> {
        for diff in &event.diffs {
            let content = serde_json::to_string(diff)
                .map_err(|e| WafError::system(format!("failed to serialize diff: {e}")))?;

            self.versions
                .create_version(RuleVersion {
                    id: 0,
                    rule_id: diff.rule_id,
                    version: event.version,
                    hash: String::new(),
                    content,
                    change_type: diff.update_type,
                    status: diff.status,
                    created_by: 0,
                    created_at: Utc::now(),
                })
                .await?;

            self.versions
                .create_sync_log(RuleSyncLog {
                    id: 0,
                    rule_id: diff.rule_id,
                    version: event.version,
                    status: SyncStatus::Success,
                    message: format!("rule {} applied", diff.update_type),
                    sync_type: diff.update_type.to_string(),
                    created_at: Utc::now(),
                })
                .await?;
        }
        Ok(())
    }

    /// Replace the live rule set with the snapshot at `version`. Rolling
    /// forward is rejected. The caller is responsible for reloading caches
    /// afterwards.
    pub async fn rollback_to(&self, version: i64) -> WafResult<RuleUpdateEvent> {
        let current = self.rules.latest_version().await?;
        if version >= current {
            return Err(WafError::invalid_params(format!(
                "cannot roll back to version {version}: current version is {current}"
            )));
        }

        let snapshot = self.versions.rules_at_version(version).await?;

        let now = Utc::now();
        let event = RuleUpdateEvent {
            id: 0,
            version: current + 1,
            action: ChangeType::Rollback,
            diffs: snapshot
                .iter()
                .map(|rule| RuleDiff {
                    rule_id: rule.id,
                    name: rule.name.clone(),
                    pattern: rule.pattern.clone(),
                    action: rule.action,
                    status: rule.status,
                    version: current + 1,
                    update_type: ChangeType::Rollback,
                    update_time: now,
                })
                .collect(),
            created_at: now,
        };

        self.rules.replace_all_rules(snapshot, event.clone()).await?;
        info!(
            target_version = version,
            new_version = event.version,
            rules = event.diffs.len(),
            "rule set rolled back"
        );
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::rule::test_rule;
    use crate::storage::memory::MemoryStore;

    fn service() -> (VersionService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (VersionService::new(store.clone(), store.clone()), store)
    }

    #[tokio::test]
    async fn test_version_lookup_and_ordering() {
        let (svc, store) = service();
        let rule = store.create_rule(test_rule(0, "r1", "/a")).await.unwrap();
        let mut updated = rule.clone();
        updated.pattern = "/b".to_string();
        store.update_rule(updated).await.unwrap();

        let v1 = svc.get_version(rule.id, 1).await.unwrap().unwrap();
        assert_eq!(v1.change_type, ChangeType::Create);
        assert!(svc.get_version(rule.id, 99).await.unwrap().is_none());

        let all = svc.list_versions(rule.id).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].version > all[1].version);
    }

    #[tokio::test]
    async fn test_rollback_restores_snapshot() {
        let (svc, store) = service();
        let rule = store.create_rule(test_rule(0, "r1", "/original")).await.unwrap(); // v1

        let mut changed = rule.clone();
        changed.pattern = "/changed".to_string();
        store.update_rule(changed).await.unwrap(); // v2

        let event = svc.rollback_to(1).await.unwrap();
        assert_eq!(event.version, 3);
        assert_eq!(event.action, ChangeType::Rollback);

        let restored = store.get_rule(rule.id).await.unwrap().unwrap();
        assert_eq!(restored.pattern, "/original");

        let events = svc.list_update_events().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, ChangeType::Rollback);
    }

    #[tokio::test]
    async fn test_rollback_forward_rejected() {
        let (svc, store) = service();
        store.create_rule(test_rule(0, "r1", "/a")).await.unwrap(); // v1

        assert!(svc.rollback_to(1).await.is_err());
        assert!(svc.rollback_to(5).await.is_err());
    }

    #[tokio::test]
    async fn test_sync_rules_records_versions_and_logs() {
        let (svc, _) = service();
        let event = RuleUpdateEvent {
            id: 0,
            version: 10,
            action: ChangeType::Update,
            diffs: vec![RuleDiff {
                rule_id: 5,
                name: "r5".to_string(),
                pattern: "/x".to_string(),
                action: crate::model::ActionType::Block,
                status: crate::model::RuleStatus::Enabled,
                version: 10,
                update_type: ChangeType::Update,
                update_time: Utc::now(),
            }],
            created_at: Utc::now(),
        };

        svc.sync_rules(&event).await.unwrap();

        let version = svc.get_version(5, 10).await.unwrap().unwrap();
        assert_eq!(version.change_type, ChangeType::Update);

        let logs = svc.get_sync_logs(5).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, SyncStatus::Success);
    }
}
