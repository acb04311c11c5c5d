use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use loopguard::cancel::CancelToken;
use loopguard::controller::{MissionController, MissionOutcome, MissionRequest};
use loopguard::core::budget::TokenUsage;
use loopguard::core::criteria::Criterion;
use loopguard::core::types::{FailureClass, RecordStatus, StopReason};
use loopguard::io::config::ControllerConfig;
use loopguard::io::context::NoContext;
use loopguard::io::memory::MemoryStore;
use loopguard::io::reasoner::{AuditVerdict, Directive};
use loopguard::test_support::{ScriptedExecutor, ScriptedReasoner, ScriptedRun, TestRepo, contract};

fn contains(path: &str, pattern: &str) -> Criterion {
    Criterion::Contains {
        path: path.to_string(),
        pattern: pattern.to_string(),
    }
}

fn shell(script: &str) -> Criterion {
    Criterion::Command {
        cmd: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        timeout_secs: None,
    }
}

fn history(repo: &TestRepo) -> MemoryStore {
    MemoryStore::open(&repo.root().join(".loopguard/history.jsonl")).expect("open history")
}

#[test]
fn failed_attempt_is_rolled_back_and_recovery_succeeds() {
    let repo = TestRepo::new().expect("repo");
    let config = ControllerConfig::default();
    let memory = history(&repo);
    let executor = ScriptedExecutor::new([
        ScriptedRun::exit(0)
            .writing("out.txt", "wrong\n")
            .writing("scratch/junk.txt", "junk\n"),
        ScriptedRun::exit(0).writing("out.txt", "all ok\n"),
    ]);
    let reasoner = ScriptedReasoner::new([contract(vec![contains("out.txt", "ok")])]);

    let outcome = MissionController::new(&config, repo.root(), &memory, &executor, &reasoner, &NoContext)
        .run(&MissionRequest::new("write ok to out.txt"))
        .expect("run");

    assert!(matches!(outcome, MissionOutcome::Succeeded { attempts: 2, .. }));
    // The reasoner planned once; attempt 2 ran the recovery directive.
    assert_eq!(reasoner.requests().len(), 1);
    let requests = executor.requests();
    assert_eq!(requests.len(), 2);
    let second = &requests[1].instruction;
    assert!(second.contains("Recover from a LOGIC failure"));
    assert!(second.contains("Do not repeat: CONTAINS `out.txt` failed"));
    assert!(!repo.root().join("scratch").exists(), "attempt 1 leftovers rolled back");

    let records = memory.records().expect("records");
    let statuses: Vec<RecordStatus> = records.iter().map(|record| record.status).collect();
    assert_eq!(statuses, [RecordStatus::Failed, RecordStatus::Completed]);
    assert_eq!(records[0].classification, Some(FailureClass::Logic));
    assert!(records[0].lesson.is_some());

    // The history survives a reopen.
    let reopened = history(&repo);
    assert_eq!(reopened.records().expect("records"), records);
}

#[test]
fn retry_bound_allows_exactly_n_plus_one_attempts() {
    let repo = TestRepo::new().expect("repo");
    let mut config = ControllerConfig::default();
    config.max_retries = 2;
    let memory = MemoryStore::in_memory();
    let executor = ScriptedExecutor::new((0..5).map(|_| ScriptedRun::exit(0)));
    let reasoner = ScriptedReasoner::new([contract(vec![contains("out.txt", "ok")])]);

    let outcome = MissionController::new(&config, repo.root(), &memory, &executor, &reasoner, &NoContext)
        .run(&MissionRequest::new("never satisfied"))
        .expect("run");

    let MissionOutcome::Failed { attempts, reason, .. } = outcome else {
        panic!("expected failure");
    };
    assert_eq!(attempts, 3);
    assert_eq!(reason, StopReason::RetriesExhausted);
    assert_eq!(executor.requests().len(), 3);

    let records = memory.records().expect("records");
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|record| record.status == RecordStatus::Failed));
    let stop_reasons: Vec<Option<StopReason>> = records.iter().map(|record| record.stop_reason).collect();
    assert_eq!(stop_reasons, [None, None, Some(StopReason::RetriesExhausted)]);
}

#[test]
fn budget_exhaustion_stops_before_a_third_plan() {
    let repo = TestRepo::new().expect("repo");
    let mut config = ControllerConfig::default();
    config.max_retries = 5;
    config.cost_budget = Some(0.50);
    config.agent.cost_per_attempt = 0.25;
    let memory = MemoryStore::in_memory();
    let executor = ScriptedExecutor::new([
        ScriptedRun::exit(0),
        ScriptedRun::exit(1).with_stderr("bash: pytest: command not found\n"),
        ScriptedRun::exit(0),
    ]);
    let reasoner = ScriptedReasoner::new([contract(vec![contains("out.txt", "ok")])]);

    let outcome = MissionController::new(&config, repo.root(), &memory, &executor, &reasoner, &NoContext)
        .run(&MissionRequest::new("never satisfied"))
        .expect("run");

    let MissionOutcome::Failed {
        attempts,
        reason,
        classification,
        cost,
        report,
        ..
    } = outcome
    else {
        panic!("expected failure");
    };
    assert_eq!(attempts, 2);
    assert_eq!(reason, StopReason::BudgetExhausted);
    assert!((cost - 0.50).abs() < 1e-9);
    assert!(report.is_some_and(|report| !report.passed));

    let records = memory.records().expect("records");
    assert_eq!(records.len(), 2);
    assert_eq!(classification, records[1].classification);
    assert_eq!(classification, Some(FailureClass::Tooling));
    assert_eq!(records[1].stop_reason, Some(StopReason::BudgetExhausted));
    assert_eq!(executor.requests().len(), 2);
    assert_eq!(reasoner.requests().len(), 1);
}

#[test]
fn missing_dependency_is_installed_before_logic_work() {
    let repo = TestRepo::new().expect("repo");
    let mut config = ControllerConfig::default();
    config.max_retries = 1;
    let memory = MemoryStore::in_memory();
    let executor = ScriptedExecutor::new([ScriptedRun::exit(0), ScriptedRun::exit(0)]);
    let reasoner = ScriptedReasoner::new([contract(vec![
        shell("echo \"ModuleNotFoundError: No module named 'requests'\" >&2; exit 1"),
        contains("out.txt", "ok"),
    ])]);

    MissionController::new(&config, repo.root(), &memory, &executor, &reasoner, &NoContext)
        .run(&MissionRequest::new("fetch data"))
        .expect("run");

    let records = memory.records().expect("records");
    assert_eq!(records[0].classification, Some(FailureClass::Tooling));

    let instruction = &executor.requests()[1].instruction;
    let install = instruction
        .find("[TOOLING] Install missing dependency `requests`")
        .expect("install step");
    let logic = instruction.find("[LOGIC]").expect("logic step");
    assert!(install < logic, "{instruction}");
}

#[test]
fn rollback_can_be_disabled() {
    let repo = TestRepo::new().expect("repo");
    let mut config = ControllerConfig::default();
    config.max_retries = 0;
    config.rollback = false;
    let memory = MemoryStore::in_memory();
    let executor = ScriptedExecutor::new([ScriptedRun::exit(0).writing("out.txt", "nope\n")]);
    let reasoner = ScriptedReasoner::new([contract(vec![contains("out.txt", "ok")])]);

    MissionController::new(&config, repo.root(), &memory, &executor, &reasoner, &NoContext)
        .run(&MissionRequest::new("write ok"))
        .expect("run");

    let records = memory.records().expect("records");
    assert!(records[0].snapshot.is_none());
    assert_eq!(
        fs::read_to_string(repo.root().join("out.txt")).expect("out.txt"),
        "nope\n"
    );
}

#[test]
fn cancellation_leaves_the_tree_and_records_the_snapshot() {
    let repo = TestRepo::new().expect("repo");
    let config = ControllerConfig::default();
    let memory = MemoryStore::in_memory();
    let cancel = CancelToken::new();
    let executor = ScriptedExecutor::new([ScriptedRun {
        hang: true,
        ..ScriptedRun::default()
    }
    .writing("partial.txt", "half done\n")])
    .cancelling(cancel.clone());
    let reasoner = ScriptedReasoner::new([contract(vec![contains("out.txt", "ok")])]);

    let outcome = MissionController::new(&config, repo.root(), &memory, &executor, &reasoner, &NoContext)
        .with_cancel(cancel)
        .run(&MissionRequest {
            goal: "slow work".to_string(),
            task_id: Some("task_cancelled".to_string()),
        })
        .expect("run");

    let MissionOutcome::Interrupted {
        task_id,
        attempts,
        snapshot,
    } = &outcome
    else {
        panic!("expected interruption, got {outcome:?}");
    };
    assert_eq!(task_id, "task_cancelled");
    assert_eq!(*attempts, 1);
    assert!(snapshot.is_some());
    assert_eq!(outcome.exit_code(), loopguard::exit_codes::INTERRUPTED);
    assert!(repo.root().join("partial.txt").exists());

    let records = memory.records().expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, RecordStatus::Interrupted);
    assert_eq!(
        memory.latest_snapshot("task_cancelled").expect("lookup"),
        snapshot.clone()
    );
}

#[test]
fn plan_rejections_are_bounded_and_classified_ambiguous() {
    let repo = TestRepo::new().expect("repo");
    let mut config = ControllerConfig::default();
    config.max_plan_rejections = 2;
    let memory = MemoryStore::in_memory();
    let executor = ScriptedExecutor::default();
    let criteria = || contract(vec![contains("out.txt", "ok")]);
    let reasoner = ScriptedReasoner::new([criteria(), criteria(), criteria()]).with_verdicts(
        (0..3).map(|n| AuditVerdict::Reject {
            reason: format!("rejection {n}"),
        }),
    );

    let outcome = MissionController::new(&config, repo.root(), &memory, &executor, &reasoner, &NoContext)
        .run(&MissionRequest::new("unclear goal"))
        .expect("run");

    let MissionOutcome::Failed {
        reason,
        classification,
        attempts,
        ..
    } = outcome
    else {
        panic!("expected failure");
    };
    assert_eq!(reason, StopReason::PlanRejected);
    assert_eq!(classification, Some(FailureClass::Ambiguity));
    assert_eq!(attempts, 0);
    assert!(executor.requests().is_empty());
    assert_eq!(reasoner.requests().len(), 3);

    let records = memory.records().expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].stop_reason, Some(StopReason::PlanRejected));
}

#[test]
fn workdir_outside_git_retries_without_rollback() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = ControllerConfig::default();
    let memory = MemoryStore::in_memory();
    let executor = ScriptedExecutor::new([
        ScriptedRun::exit(0)
            .writing("out.txt", "wrong\n")
            .writing("scratch.txt", "left behind\n"),
        ScriptedRun::exit(0).writing("out.txt", "all ok\n"),
    ]);
    let reasoner = ScriptedReasoner::new([contract(vec![contains("out.txt", "ok")])]);

    let outcome = MissionController::new(&config, dir.path(), &memory, &executor, &reasoner, &NoContext)
        .run(&MissionRequest::new("write ok to out.txt"))
        .expect("run");

    assert!(matches!(outcome, MissionOutcome::Succeeded { attempts: 2, .. }), "{outcome:?}");
    let records = memory.records().expect("records");
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|record| record.snapshot.is_none()));
    // Nothing to restore from, so attempt 1 leftovers stay.
    assert!(dir.path().join("scratch.txt").exists());
}

#[test]
fn cancellation_during_verification_interrupts_instead_of_rolling_back() {
    let repo = TestRepo::new().expect("repo");
    let mut config = ControllerConfig::default();
    config.max_retries = 1;
    let memory = MemoryStore::in_memory();
    let cancel = CancelToken::new();
    let executor = ScriptedExecutor::new([
        ScriptedRun::exit(0).writing("out.txt", "agent work\n"),
        ScriptedRun::exit(0),
    ]);
    let reasoner = ScriptedReasoner::new([contract(vec![shell(
        "touch verifying.flag; sleep 1; exit 1",
    )])]);

    // Cancel once the check is running, as a Ctrl-C would.
    let flag = repo.root().join("verifying.flag");
    let watcher = {
        let cancel = cancel.clone();
        thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(20);
            while !flag.exists() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            cancel.cancel();
        })
    };

    let outcome = MissionController::new(&config, repo.root(), &memory, &executor, &reasoner, &NoContext)
        .with_cancel(cancel)
        .run(&MissionRequest::new("slow checks"))
        .expect("run");
    watcher.join().expect("watcher");

    let MissionOutcome::Interrupted { attempts, snapshot, .. } = &outcome else {
        panic!("expected interruption, got {outcome:?}");
    };
    assert_eq!(*attempts, 1);
    assert!(snapshot.is_some());
    assert_eq!(executor.requests().len(), 1);
    assert_eq!(
        fs::read_to_string(repo.root().join("out.txt")).expect("agent output kept"),
        "agent work\n"
    );

    let records = memory.records().expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, RecordStatus::Interrupted);
    assert_eq!(&records[0].snapshot, snapshot);
}

#[test]
fn planning_spend_past_the_budget_stops_before_execution() {
    let repo = TestRepo::new().expect("repo");
    let mut config = ControllerConfig::default();
    config.cost_budget = Some(0.05);
    let memory = MemoryStore::in_memory();
    let executor = ScriptedExecutor::new([ScriptedRun::exit(0).writing("out.txt", "ok\n")]);
    // 1M input tokens at the gemini-2.0-flash rate: $0.10 per directive.
    let expensive = || {
        Ok(Directive {
            contract: contract(vec![contains("out.txt", "ok")]),
            usage: Some(TokenUsage {
                input_tokens: 1_000_000,
                output_tokens: 0,
            }),
        })
    };
    let reasoner = ScriptedReasoner::default()
        .with_directive(expensive())
        .with_directive(expensive())
        .with_verdicts([AuditVerdict::Reject {
            reason: "too vague".to_string(),
        }]);

    let outcome = MissionController::new(&config, repo.root(), &memory, &executor, &reasoner, &NoContext)
        .run(&MissionRequest::new("write ok"))
        .expect("run");

    let MissionOutcome::Failed {
        reason,
        attempts,
        cost,
        ..
    } = outcome
    else {
        panic!("expected failure");
    };
    assert_eq!(reason, StopReason::BudgetExhausted);
    assert_eq!(attempts, 0);
    assert!((cost - 0.10).abs() < 1e-9, "cost {cost}");
    assert_eq!(reasoner.requests().len(), 1);
    assert!(executor.requests().is_empty());

    let records = memory.records().expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].stop_reason, Some(StopReason::BudgetExhausted));
    assert!((records[0].cost - 0.10).abs() < 1e-9);
}
