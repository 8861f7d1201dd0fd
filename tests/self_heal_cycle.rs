//! Self-heal cycles built from configuration
//!
//! The agent is assembled the way the CLI assembles it: a YAML config
//! supplies shell readiness and re-run commands, and items persist in a
//! SQLite file between cycles.
//!
//! Run with: `cargo test --test self_heal_cycle`

#![cfg(unix)]

mod common;

use common::temp_db;
use stagegate::heal::{CycleOptions, HealAction, ItemResult};
use stagegate::{
    CoordinationError, ExitStatus, ItemStatus, ManualClock, OpenStore, RerunStep, SelfHealAgent,
    SqliteStore, StagegateConfig,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

fn agent_from_config(yaml: &str, db: &Path, clock: Arc<ManualClock>) -> SelfHealAgent<SqliteStore> {
    let config = StagegateConfig::from_yaml(yaml).unwrap();
    let store = Arc::new(SqliteStore::open(db).unwrap());
    let readiness = config.self_heal.readiness().unwrap();
    let mut agent = SelfHealAgent::new(store, clock, Arc::new(readiness), config.self_heal.settings());
    for step in config.self_heal.steps() {
        agent = agent.with_step(Arc::new(step) as Arc<dyn RerunStep>);
    }
    agent
}

fn config_yaml(dir: &Path, partial_failure: &str) -> String {
    format!(
        r#"
self_heal:
  max_checks: 3
  partial_failure: {partial}
  command_timeout_secs: 10
  readiness_command: 'test -f "{dir}/$STAGEGATE_ITEM_ID.ready"'
  rerun_steps:
    - name: features
      command: 'touch "{dir}/$STAGEGATE_ITEM_ID.features"'
    - name: broken
      command: 'exit 3'
    - name: predictions
      command: 'echo "$STAGEGATE_CTX_GAME_DATE" > "{dir}/$STAGEGATE_ITEM_ID.predictions"'
"#,
        dir = dir.display(),
        partial = partial_failure,
    )
}

fn result<'a>(results: &'a [ItemResult], item_id: &str) -> &'a ItemResult {
    results.iter().find(|r| r.item_id == item_id).unwrap()
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn ready_item_completes_and_every_step_runs() {
    let (dir, db) = temp_db();
    let clock = Arc::new(ManualClock::starting_now());
    let agent = agent_from_config(&config_yaml(dir.path(), "warn"), &db, clock);

    let context = BTreeMap::from([("game_date".to_string(), "2024-01-15".to_string())]);
    agent.enqueue("lineup-fix", None, context).unwrap();
    std::fs::write(dir.path().join("lineup-fix.ready"), "").unwrap();

    let report = agent.run_cycle(CycleOptions::default()).unwrap();
    let item = result(&report.results, "lineup-fix");
    assert_eq!(item.action, HealAction::Completed);
    assert_eq!(item.failed_steps, vec!["broken".to_string()]);

    // A failing step does not stop the ones after it.
    assert!(dir.path().join("lineup-fix.features").exists());
    let predictions = std::fs::read_to_string(dir.path().join("lineup-fix.predictions")).unwrap();
    assert_eq!(predictions.trim(), "2024-01-15");

    assert_eq!(report.exit_status(), ExitStatus::Warning);
    assert_eq!(agent.get("lineup-fix").unwrap().unwrap().status, ItemStatus::Completed);
}

#[test]
fn partial_failure_policy_comes_from_config() {
    let (dir, db) = temp_db();
    let clock = Arc::new(ManualClock::starting_now());
    let agent = agent_from_config(&config_yaml(dir.path(), "failure"), &db, clock);

    agent.enqueue("item-a", None, BTreeMap::new()).unwrap();
    std::fs::write(dir.path().join("item-a.ready"), "").unwrap();
    let report = agent.run_cycle(CycleOptions::default()).unwrap();
    assert_eq!(report.exit_status(), ExitStatus::Critical);
}

#[test]
fn never_ready_item_fails_on_exactly_the_last_check() {
    let (dir, db) = temp_db();
    let clock = Arc::new(ManualClock::starting_now());
    let agent = agent_from_config(&config_yaml(dir.path(), "warn"), &db, clock.clone());
    agent.enqueue("item-b", None, BTreeMap::new()).unwrap();

    for expected in 1..=2 {
        let report = agent.run_cycle(CycleOptions::default()).unwrap();
        let item = result(&report.results, "item-b");
        assert_eq!(item.action, HealAction::StillPending);
        assert_eq!(item.check_count, expected);
        assert!(report.alerts().is_empty());
        clock.advance_secs(900);
    }

    let report = agent.run_cycle(CycleOptions::default()).unwrap();
    assert_eq!(result(&report.results, "item-b").action, HealAction::Failed);
    assert_eq!(report.exit_status(), ExitStatus::Critical);
    match report.alerts().as_slice() {
        [CoordinationError::MaxRetriesExceeded {
            item_id,
            check_count,
            max_checks,
            ..
        }] => {
            assert_eq!(item_id, "item-b");
            assert_eq!((*check_count, *max_checks), (3, 3));
        }
        other => panic!("expected one alert, got {:?}", other),
    }

    // Terminal items are left alone by later cycles.
    clock.advance_secs(900);
    let report = agent.run_cycle(CycleOptions::default()).unwrap();
    assert_eq!(report.examined, 0);
    assert_eq!(agent.get("item-b").unwrap().unwrap().check_count, 3);
}

#[test]
fn items_survive_reopening_the_database() {
    let (dir, db) = temp_db();
    let clock = Arc::new(ManualClock::starting_now());
    {
        let agent = agent_from_config(&config_yaml(dir.path(), "warn"), &db, clock.clone());
        agent.enqueue("item-c", Some(5), BTreeMap::new()).unwrap();
        agent.run_cycle(CycleOptions::default()).unwrap();
    }

    let agent = agent_from_config(&config_yaml(dir.path(), "warn"), &db, clock);
    let item = agent.get("item-c").unwrap().unwrap();
    assert_eq!(item.check_count, 1);
    assert_eq!(item.max_checks, 5);
    assert_eq!(item.status, ItemStatus::Pending);
}

#[test]
fn dry_run_reports_without_side_effects() {
    let (dir, db) = temp_db();
    let clock = Arc::new(ManualClock::starting_now());
    let agent = agent_from_config(&config_yaml(dir.path(), "warn"), &db, clock);
    agent.enqueue("item-d", None, BTreeMap::new()).unwrap();
    std::fs::write(dir.path().join("item-d.ready"), "").unwrap();

    let report = agent
        .run_cycle(CycleOptions {
            dry_run: true,
            lookback: None,
        })
        .unwrap();
    assert!(report.dry_run);
    assert_eq!(result(&report.results, "item-d").action, HealAction::Completed);
    assert!(!dir.path().join("item-d.features").exists());
    assert_eq!(agent.get("item-d").unwrap().unwrap().status, ItemStatus::Pending);
}
