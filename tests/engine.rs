//! End-to-end scenarios against the in-memory stores.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use waf_engine::model::{LimitUnit, RuleCombinator, RuleVariable};
use waf_engine::model::{BlockType, ChangeType, IpListType};
use waf_engine::storage::memory::{MemoryKv, MemoryStore};
use waf_engine::{
    ActionType, CancelToken, CcRule, CcService, CheckRequest, IpRule, IpService, Rule, RuleEngine,
    RuleStatus, RuleType, Severity,
};

fn rule(name: &str, pattern: &str) -> Rule {
    Rule {
        id: 0,
        name: name.to_string(),
        description: String::new(),
        pattern: pattern.to_string(),
        params: serde_json::Value::Null,
        rule_type: RuleType::Regex,
        variable: RuleVariable::RequestUri,
        action: ActionType::Block,
        priority: 10,
        status: RuleStatus::Enabled,
        severity: Severity::High,
        combinator: None,
        version: 0,
        hash: String::new(),
        created_by: 1,
        updated_by: 1,
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    }
}

fn request(uri: &str) -> CheckRequest {
    CheckRequest {
        client_ip: "1.2.3.4".to_string(),
        uri: uri.to_string(),
        headers: HashMap::new(),
        args: HashMap::new(),
        body: String::new(),
        method: "GET".to_string(),
        rule_types: Vec::new(),
    }
}

// Scenario 1: URI block.
#[tokio::test]
async fn uri_block_rule_fires_on_matching_path_only() {
    let engine = RuleEngine::in_memory();
    let cancel = CancelToken::new();

    let stored = engine.create_rule(rule("admin-guard", "^/admin/.*")).await.unwrap();

    let hit = engine.check(&cancel, &request("/admin/login")).await.unwrap();
    assert!(hit.matched);
    assert_eq!(hit.action, ActionType::Block);
    assert_eq!(hit.matched_rule.unwrap().id, stored.id);

    let miss = engine.check(&cancel, &request("/public")).await.unwrap();
    assert!(!miss.matched);
    assert_eq!(miss.action, ActionType::Allow);
}

// Scenario 1, trie flavor: the pipeline's URL index understands segment
// wildcards.
#[tokio::test]
async fn pipeline_scan_matches_wildcard_segments() {
    let engine = RuleEngine::in_memory();
    let cancel = CancelToken::new();
    engine.create_rule(rule("admin-wild", "/admin/*")).await.unwrap();

    let matches = engine.scan_request(&cancel, &request("/admin/login")).await.unwrap();
    assert!(!matches.is_empty());

    let matches = engine.scan_request(&cancel, &request("/public")).await.unwrap();
    assert!(matches.is_empty());
}

// Scenario 2: CC limit over a one-second window.
#[tokio::test]
async fn cc_limit_allows_exactly_limit_rate_within_window() {
    let store = Arc::new(MemoryStore::new());
    let kv = Arc::new(MemoryKv::new());
    let cc = CcService::new(store, kv);
    let cancel = CancelToken::new();

    cc.create_cc_rule(CcRule {
        id: 0,
        uri: "/api".to_string(),
        limit_rate: 3,
        time_window: 1,
        limit_unit: LimitUnit::Second,
        status: RuleStatus::Enabled,
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    })
    .await
    .unwrap();

    let mut verdicts = Vec::new();
    for _ in 0..5 {
        verdicts.push(cc.check_cc_limit(&cancel, "/api").await.unwrap());
    }
    assert_eq!(verdicts, vec![false, false, false, true, true]);

    // After the window passes, the counter is clean again.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(!cc.check_cc_limit(&cancel, "/api").await.unwrap());
}

// Scenario 3: SQL injection in the request body.
#[tokio::test]
async fn sqli_rule_blocks_union_select_body() {
    let engine = RuleEngine::in_memory();
    let cancel = CancelToken::new();

    let mut sqli_rule = rule("sqli-body", "sqli");
    sqli_rule.rule_type = RuleType::Sqli;
    sqli_rule.variable = RuleVariable::RequestBody;
    sqli_rule.priority = 5;
    engine.create_rule(sqli_rule).await.unwrap();

    let mut req = request("/q");
    req.method = "POST".to_string();
    req.body = "1 UNION SELECT 1,2--".to_string();

    let result = engine.check(&cancel, &req).await.unwrap();
    assert!(result.matched);
    assert_eq!(result.action, ActionType::Block);

    let mut clean = request("/q");
    clean.method = "POST".to_string();
    clean.body = "ordinary form text".to_string();
    assert!(!engine.check(&cancel, &clean).await.unwrap().matched);
}

// Scenario 4: whitelist and block verdicts are separate policies.
#[tokio::test]
async fn whitelist_rule_is_not_a_block() {
    let store = Arc::new(MemoryStore::new());
    let kv = Arc::new(MemoryKv::new());
    let ip = IpService::new(store, kv, Duration::from_secs(60));
    let cancel = CancelToken::new();

    ip.create_ip_rule(IpRule {
        id: 0,
        ip: "9.9.9.9".to_string(),
        ip_type: IpListType::White,
        block_type: BlockType::Permanent,
        expire_time: None,
        description: String::new(),
        created_by: 0,
        updated_by: 0,
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    })
    .await
    .unwrap();

    assert!(ip.is_whitelisted(&cancel, "9.9.9.9").await.unwrap());
    assert!(!ip.is_blocked(&cancel, "9.9.9.9").await.unwrap());
}

// Scenario 5: equal priorities resolve deterministically.
#[tokio::test]
async fn priority_ties_break_deterministically() {
    let engine = RuleEngine::in_memory();
    let cancel = CancelToken::new();

    engine.create_rule(rule("tie-a", "^/admin")).await.unwrap();
    engine.create_rule(rule("tie-b", "^/admin")).await.unwrap();

    let first = engine
        .check(&cancel, &request("/admin"))
        .await
        .unwrap()
        .matched_rule
        .unwrap()
        .id;
    for _ in 0..10 {
        let winner = engine
            .check(&cancel, &request("/admin"))
            .await
            .unwrap()
            .matched_rule
            .unwrap()
            .id;
        assert_eq!(winner, first);
    }
}

// Scenario 6: rollback restores the historical rule and records the event.
#[tokio::test]
async fn rollback_restores_rule_and_records_event() {
    let engine = RuleEngine::in_memory();
    let cancel = CancelToken::new();

    let original = engine.create_rule(rule("r1", "^/v1/.*")).await.unwrap(); // v1

    let mut changed = original.clone();
    changed.pattern = "^/v2/.*".to_string();
    engine.update_rule(changed).await.unwrap(); // v2

    let event = engine.rollback_to(&cancel, 1).await.unwrap();
    assert_eq!(event.version, 3);
    assert_eq!(event.action, ChangeType::Rollback);

    let restored = engine.get_rule(original.id).await.unwrap().unwrap();
    assert_eq!(restored.pattern, "^/v1/.*");

    let events = engine.version_service().list_update_events().await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.action == ChangeType::Rollback && e.version == 3));

    // The restored pattern is live for checks again.
    assert!(engine.check(&cancel, &request("/v1/x")).await.unwrap().matched);
    assert!(!engine.check(&cancel, &request("/v2/x")).await.unwrap().matched);
}

// Reload property: rules deleted before a reload never match afterwards.
#[tokio::test]
async fn reload_drops_deleted_rules_from_checks() {
    let engine = RuleEngine::in_memory();
    let cancel = CancelToken::new();

    let keep = engine.create_rule(rule("keep", "^/keep")).await.unwrap();
    let doomed = engine.create_rule(rule("doomed", "^/drop")).await.unwrap();

    engine.delete_rule(doomed.id).await.unwrap();
    engine.reload_rules(&cancel).await.unwrap();

    assert!(engine.check(&cancel, &request("/keep")).await.unwrap().matched);
    assert!(!engine.check(&cancel, &request("/drop")).await.unwrap().matched);

    // Reload also leaves sync logs for the surviving rule.
    let logs = engine.version_service().get_sync_logs(keep.id).await.unwrap();
    assert!(!logs.is_empty());
}

// Cancellation propagates through the whole check path.
#[tokio::test]
async fn cancelled_token_aborts_check() {
    let engine = RuleEngine::in_memory();
    engine.create_rule(rule("admin", "^/admin")).await.unwrap();

    let cancel = CancelToken::new();
    cancel.cancel();
    assert!(engine.check(&cancel, &request("/admin")).await.is_err());
}

// Combinator rules evaluate through the expression path in the pipeline.
#[tokio::test]
async fn combinator_field_round_trips_through_storage() {
    let engine = RuleEngine::in_memory();

    let mut not_rule = rule("negated", "^/never");
    not_rule.combinator = Some(RuleCombinator::Not);
    let stored = engine.create_rule(not_rule).await.unwrap();

    let loaded = engine.get_rule(stored.id).await.unwrap().unwrap();
    assert_eq!(loaded.combinator, Some(RuleCombinator::Not));
}

// Import/export round trip preserves the rule set.
#[tokio::test]
async fn import_export_round_trip() {
    let engine = RuleEngine::in_memory();

    engine
        .import_rules(vec![rule("i1", "^/one"), rule("i2", "^/two")])
        .await
        .unwrap();

    let exported = engine.export_rules(&Default::default()).await.unwrap();
    let mut names: Vec<String> = exported.iter().map(|r| r.name.clone()).collect();
    names.sort();
    assert_eq!(names, vec!["i1", "i2"]);
}
