//! Mission controller: drives one mission through plan, audit, execute,
//! verify and recover until it succeeds, fails or is interrupted.

use std::ops::ControlFlow;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use tracing::{info, info_span, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::budget::{CostLedger, TokenUsage, pricing_for, remaining_budget};
use crate::core::classifier::{class_of, extract_signals};
use crate::core::contract::MissionContract;
use crate::core::criteria::Criterion;
use crate::core::lessons::derive_lesson;
use crate::core::lifecycle::{
    Lifecycle, Phase, RecoveryDecision, after_failure, after_rejection, budget_gate,
};
use crate::core::recovery::build_recovery_directive;
use crate::core::types::{FailureClass, RecordStatus, StopReason, VerificationReport};
use crate::exit_codes;
use crate::io::baseline::TreeBaseline;
use crate::io::config::ControllerConfig;
use crate::io::context::{ContextSource, load_rules};
use crate::io::evaluator::{EvalContext, VerificationSettings};
use crate::io::executor::{ExecOutput, ExecRequest, Executor, write_executor_log};
use crate::io::instruction::render_instruction;
use crate::io::memory::{MemoryStore, MissionRecord};
use crate::io::preflight::preflight;
use crate::io::reasoner::{AuditVerdict, PlanRequest, Reasoner};
use crate::io::rollback::{RepositorySnapshot, RollbackManager};
use crate::io::verification;

/// Longest single wait on the agent before cancellation and deadlines are
/// re-checked.
const POLL_SLICE: Duration = Duration::from_millis(200);

/// Exit code shells report for a process ended by SIGINT.
const SIGINT_EXIT: i32 = 130;

#[derive(Debug, Clone)]
pub struct MissionRequest {
    pub goal: String,
    /// Generated when absent.
    pub task_id: Option<String>,
}

impl MissionRequest {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            task_id: None,
        }
    }
}

/// How a mission ended.
#[derive(Debug, Clone, PartialEq)]
pub enum MissionOutcome {
    Succeeded {
        task_id: String,
        attempts: u32,
        report: VerificationReport,
        cost: f64,
    },
    Failed {
        task_id: String,
        attempts: u32,
        reason: StopReason,
        classification: Option<FailureClass>,
        /// Report of the last executed attempt, if any ran.
        report: Option<VerificationReport>,
        cost: f64,
    },
    Interrupted {
        task_id: String,
        attempts: u32,
        /// Pre-attempt snapshot, for `loopguard rollback`.
        snapshot: Option<RepositorySnapshot>,
    },
}

impl MissionOutcome {
    pub fn task_id(&self) -> &str {
        match self {
            MissionOutcome::Succeeded { task_id, .. }
            | MissionOutcome::Failed { task_id, .. }
            | MissionOutcome::Interrupted { task_id, .. } => task_id,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            MissionOutcome::Succeeded { .. } => exit_codes::OK,
            MissionOutcome::Failed { .. } => exit_codes::FAILED,
            MissionOutcome::Interrupted { .. } => exit_codes::INTERRUPTED,
        }
    }
}

/// Result of [`MissionController::dry_run`].
#[derive(Debug, Clone, PartialEq)]
pub enum DryRun {
    /// The contract passed auditing; `instruction` is what the agent would get.
    Ready {
        contract: MissionContract,
        instruction: String,
    },
    /// Planning stopped before anything could run.
    Stopped(MissionOutcome),
}

/// `task_<utc timestamp>_<6 random chars>`.
pub fn generate_task_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix = std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase();
    format!("task_{}_{suffix}", Utc::now().format("%Y%m%dT%H%M%S"))
}

/// Mutable state of one mission.
#[derive(Debug)]
struct Mission {
    task_id: String,
    lifecycle: Lifecycle,
    ledger: CostLedger,
    attempts: u32,
    rejections: u32,
    /// Repository context for the reasoner, extracted once.
    context: String,
    /// Project rules, passed to the reasoner and the agent.
    rules: Option<String>,
    feedback: Option<String>,
    /// Contract planned by the reasoner; recovery directives derive from it.
    base: Option<MissionContract>,
    /// Next contract, already produced by the recovery strategist.
    recovery: Option<MissionContract>,
    /// Spend not yet attributed to a record (planning calls).
    unrecorded_cost: f64,
    last_report: Option<VerificationReport>,
    last_class: Option<FailureClass>,
}

impl Mission {
    fn charge(&mut self, amount: f64) {
        self.ledger.add(amount);
        if amount.is_finite() && amount > 0.0 {
            self.unrecorded_cost += amount;
        }
    }

    /// Spend to store on the next record.
    fn take_cost(&mut self) -> f64 {
        std::mem::take(&mut self.unrecorded_cost)
    }
}

struct Execution {
    output: ExecOutput,
    cancelled: bool,
}

/// One executed and verified attempt.
struct Attempt {
    number: u32,
    snapshot: Option<RepositorySnapshot>,
    output: ExecOutput,
    report: VerificationReport,
    duration_ms: u64,
}

pub struct MissionController<'a, E: Executor> {
    config: &'a ControllerConfig,
    workdir: &'a Path,
    memory: &'a MemoryStore,
    executor: &'a E,
    reasoner: &'a dyn Reasoner,
    context: &'a dyn ContextSource,
    rollback: Option<RollbackManager>,
    cancel: CancelToken,
}

impl<'a, E: Executor> MissionController<'a, E> {
    pub fn new(
        config: &'a ControllerConfig,
        workdir: &'a Path,
        memory: &'a MemoryStore,
        executor: &'a E,
        reasoner: &'a dyn Reasoner,
        context: &'a dyn ContextSource,
    ) -> Self {
        let rollback = config
            .rollback
            .then(|| RollbackManager::new(workdir, config.state_dir.clone()));
        Self {
            config,
            workdir,
            memory,
            executor,
            reasoner,
            context,
            rollback,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Drive one mission to a terminal phase.
    ///
    /// Errors are reserved for failures of the controller itself (history
    /// writes, rollback, invalid configuration); anything the agent or a
    /// criterion does wrong ends up in the outcome.
    pub fn run(&self, request: &MissionRequest) -> Result<MissionOutcome> {
        let task_id = request.task_id.clone().unwrap_or_else(generate_task_id);
        let _span = info_span!("mission", task_id = %task_id).entered();
        let mut mission = self.start(task_id)?;
        let settings = VerificationSettings::from_config(self.config)?;
        info!(goal = %request.goal, max_retries = self.config.max_retries, "mission started");

        loop {
            let contract = match self.plan_phase(&mut mission, &request.goal)? {
                ControlFlow::Continue(contract) => contract,
                ControlFlow::Break(outcome) => return Ok(outcome),
            };
            let attempt = match self.execute_phase(&mut mission, &contract, &settings)? {
                ControlFlow::Continue(attempt) => attempt,
                ControlFlow::Break(outcome) => return Ok(outcome),
            };
            if attempt.report.passed {
                return self.succeed(&mut mission, contract, attempt);
            }
            let recovered = self.recover_phase(&mut mission, contract, attempt)?;
            if let ControlFlow::Break(outcome) = recovered {
                return Ok(outcome);
            }
        }
    }

    /// Plan and audit once without executing anything.
    ///
    /// Refusals are recorded as in [`run`](Self::run); callers that want
    /// history untouched pass an in-memory store.
    pub fn dry_run(&self, request: &MissionRequest) -> Result<DryRun> {
        let task_id = request.task_id.clone().unwrap_or_else(generate_task_id);
        let _span = info_span!("dry_run", task_id = %task_id).entered();
        let mut mission = self.start(task_id)?;
        match self.plan_phase(&mut mission, &request.goal)? {
            ControlFlow::Continue(contract) => {
                let instruction = render_instruction(&contract, 1, mission.rules.as_deref())?;
                Ok(DryRun::Ready {
                    contract,
                    instruction,
                })
            }
            ControlFlow::Break(outcome) => Ok(DryRun::Stopped(outcome)),
        }
    }

    fn start(&self, task_id: String) -> Result<Mission> {
        self.config.validate().context("invalid controller config")?;
        let context = match self.context.extract(self.workdir) {
            Ok(text) => text,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "context extraction failed; planning without it");
                String::new()
            }
        };
        Ok(Mission {
            task_id,
            lifecycle: Lifecycle::new(),
            ledger: CostLedger::new(self.config.cost_budget),
            attempts: 0,
            rejections: 0,
            context,
            rules: load_rules(&self.config.rules_path_in(self.workdir)),
            feedback: None,
            base: None,
            recovery: None,
            unrecorded_cost: 0.0,
            last_report: None,
            last_class: None,
        })
    }

    /// PLANNING and AUDITING, repeated until a contract is accepted or the
    /// mission has to stop.
    fn plan_phase(
        &self,
        mission: &mut Mission,
        goal: &str,
    ) -> Result<ControlFlow<MissionOutcome, MissionContract>> {
        loop {
            let next = mission.attempts + 1;
            if self.cancel.is_cancelled() {
                return self
                    .interrupt(mission, next, None, None, None, 0)
                    .map(ControlFlow::Break);
            }
            if let RecoveryDecision::Stop(reason) = budget_gate(&mission.ledger) {
                return self
                    .stop_unplanned(mission, None, reason)
                    .map(ControlFlow::Break);
            }
            let plan_request = PlanRequest {
                goal: goal.to_string(),
                context: mission.context.clone(),
                model: self.config.model.clone(),
                feedback: mission.feedback.take(),
                attempt: next,
                rules: mission.rules.clone(),
            };
            let planned = match mission.recovery.take() {
                Some(contract) => Ok(contract),
                None => self.plan(&plan_request, mission),
            };
            let contract = match planned {
                Ok(contract) => contract.with_guardrails(&self.guardrails()),
                Err(err) => {
                    let reason = format!("planning failed: {err:#}");
                    warn!(err = %reason, "no directive");
                    if let Some(stop) = self.reject(mission, reason, StopReason::PlanningError) {
                        return self
                            .stop_unplanned(mission, None, stop)
                            .map(ControlFlow::Break);
                    }
                    continue;
                }
            };

            mission.lifecycle.advance(Phase::Auditing)?;
            if self.cancel.is_cancelled() {
                return self
                    .interrupt(mission, next, Some(contract), None, None, 0)
                    .map(ControlFlow::Break);
            }
            if let Some(reason) = self.audit(&plan_request, &contract) {
                warn!(reason = %reason, "contract rejected");
                if let Some(stop) = self.reject(mission, reason, StopReason::PlanRejected) {
                    return self
                        .stop_unplanned(mission, Some(contract), stop)
                        .map(ControlFlow::Break);
                }
                mission.lifecycle.advance(Phase::Planning)?;
                continue;
            }
            if let Some(max_cost) = contract.budget.max_cost {
                mission.ledger.cap(max_cost);
            }
            // Planning may have spent the rest of the budget.
            if let RecoveryDecision::Stop(reason) = budget_gate(&mission.ledger) {
                return self
                    .stop_unplanned(mission, Some(contract), reason)
                    .map(ControlFlow::Break);
            }
            if mission.base.is_none() {
                mission.base = Some(contract.clone());
            }
            return Ok(ControlFlow::Continue(contract));
        }
    }

    /// EXECUTING and VERIFYING one attempt.
    fn execute_phase(
        &self,
        mission: &mut Mission,
        contract: &MissionContract,
        settings: &VerificationSettings,
    ) -> Result<ControlFlow<MissionOutcome, Attempt>> {
        mission.lifecycle.advance(Phase::Executing)?;
        if self.cancel.is_cancelled() {
            let next = mission.attempts + 1;
            return self
                .interrupt(mission, next, Some(contract.clone()), None, None, 0)
                .map(ControlFlow::Break);
        }
        mission.attempts += 1;
        let number = mission.attempts;
        let started = Instant::now();

        let baseline = match TreeBaseline::capture(self.workdir, &settings.exclude_patterns) {
            Ok(baseline) => Some(baseline),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "baseline capture failed");
                None
            }
        };
        let snapshot = self.rollback.as_ref().and_then(|manager| match manager.snapshot() {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                warn!(err = %err, "no snapshot; this attempt cannot be rolled back");
                None
            }
        });

        let exec_request = ExecRequest {
            workdir: self.workdir.to_path_buf(),
            instruction: render_instruction(contract, number, mission.rules.as_deref())?,
            model: self.config.model.clone(),
        };
        let execution = self.execute(&exec_request, agent_time_limit(self.config, contract))?;
        self.write_log(&mission.task_id, number, &execution.output);

        let agent_cost = match execution.output.usage {
            Some(usage) => self.price(usage),
            None => self.config.agent.cost_per_attempt,
        };
        mission.charge(agent_cost);

        let exit_code = execution.output.exit_code;
        if execution.cancelled || exit_code == Some(SIGINT_EXIT) {
            return self
                .interrupt(
                    mission,
                    number,
                    Some(contract.clone()),
                    snapshot,
                    exit_code,
                    elapsed_ms(started),
                )
                .map(ControlFlow::Break);
        }

        mission.lifecycle.advance(Phase::Verifying)?;
        let eval_ctx = EvalContext {
            workdir: self.workdir,
            baseline: baseline.as_ref(),
            settings,
        };
        let report = verification::run(contract, &eval_ctx);
        let duration_ms = elapsed_ms(started);
        // A Ctrl-C during a long check must not be followed by a restore.
        if self.cancel.is_cancelled() {
            return self
                .interrupt(
                    mission,
                    number,
                    Some(contract.clone()),
                    snapshot,
                    exit_code,
                    duration_ms,
                )
                .map(ControlFlow::Break);
        }
        Ok(ControlFlow::Continue(Attempt {
            number,
            snapshot,
            output: execution.output,
            report,
            duration_ms,
        }))
    }

    fn succeed(
        &self,
        mission: &mut Mission,
        contract: MissionContract,
        attempt: Attempt,
    ) -> Result<MissionOutcome> {
        mission.lifecycle.advance(Phase::Succeeded)?;
        if attempt.output.exit_code.is_some_and(|code| code != 0) {
            warn!(
                exit_code = ?attempt.output.exit_code,
                "agent exited non-zero but every criterion passed"
            );
        }
        let cost = mission.take_cost();
        self.memory.append(MissionRecord {
            contract: Some(contract),
            report: Some(attempt.report.clone()),
            cost,
            snapshot: attempt.snapshot,
            exit_code: attempt.output.exit_code,
            duration_ms: attempt.duration_ms,
            ..self.record(&mission.task_id, attempt.number, RecordStatus::Completed)
        })?;
        info!(attempts = attempt.number, cost = mission.ledger.spent(), "mission succeeded");
        Ok(MissionOutcome::Succeeded {
            task_id: mission.task_id.clone(),
            attempts: attempt.number,
            report: attempt.report,
            cost: mission.ledger.spent(),
        })
    }

    /// RECOVERING: classify, record, roll back, then either stop or queue the
    /// recovery directive for the next PLANNING round.
    fn recover_phase(
        &self,
        mission: &mut Mission,
        contract: MissionContract,
        attempt: Attempt,
    ) -> Result<ControlFlow<MissionOutcome>> {
        mission.lifecycle.advance(Phase::Recovering)?;
        let Attempt {
            number,
            snapshot,
            output,
            report,
            duration_ms,
        } = attempt;
        let signals = extract_signals(&report, output.exit_code, &output.stderr);
        let class = class_of(&signals);
        let lesson = derive_lesson(class, &signals, &report, &output.stderr);
        let decision = after_failure(number, self.config.max_retries, &mission.ledger);
        let stop_reason = match decision {
            RecoveryDecision::Stop(reason) => Some(reason),
            RecoveryDecision::Replan => None,
        };
        warn!(
            attempt = number,
            class = %class,
            failed = report.failed_count(),
            signals = ?signals,
            "attempt failed"
        );

        let cost = mission.take_cost();
        let signature = lesson.signature.clone();
        self.memory.append(MissionRecord {
            contract: Some(contract.clone()),
            report: Some(report.clone()),
            classification: Some(class),
            signals: signals.iter().copied().collect(),
            lesson: Some(lesson),
            cost,
            stop_reason,
            snapshot: snapshot.clone(),
            exit_code: output.exit_code,
            duration_ms,
            ..self.record(&mission.task_id, number, RecordStatus::Failed)
        })?;

        if let (Some(manager), Some(snapshot)) = (&self.rollback, &snapshot) {
            manager
                .restore(snapshot)
                .with_context(|| format!("roll back attempt {number}"))?;
        }
        mission.last_report = Some(report.clone());
        mission.last_class = Some(class);

        match decision {
            RecoveryDecision::Stop(reason) => {
                mission.lifecycle.advance(Phase::Failed)?;
                warn!(reason = %reason, attempts = number, "mission failed");
                Ok(ControlFlow::Break(MissionOutcome::Failed {
                    task_id: mission.task_id.clone(),
                    attempts: number,
                    reason,
                    classification: Some(class),
                    report: Some(report),
                    cost: mission.ledger.spent(),
                }))
            }
            RecoveryDecision::Replan => {
                let lessons =
                    self.memory
                        .retrieve_lessons(class, &signature, self.config.lessons.limit)?;
                let base = mission.base.as_ref().unwrap_or(&contract);
                mission.recovery = Some(build_recovery_directive(
                    base,
                    &report,
                    output.exit_code,
                    &output.stderr,
                    class,
                    &lessons,
                ));
                mission.lifecycle.advance(Phase::Planning)?;
                info!(next_attempt = number + 1, lessons = lessons.len(), "replanning");
                Ok(ControlFlow::Continue(()))
            }
        }
    }

    /// Implicit criteria added to every contract.
    fn guardrails(&self) -> Vec<Criterion> {
        if self.config.protected_paths.is_empty() {
            return Vec::new();
        }
        vec![Criterion::NoClobber {
            paths: self.config.protected_paths.clone(),
        }]
    }

    #[instrument(skip_all, fields(attempt = request.attempt))]
    fn plan(&self, request: &PlanRequest, mission: &mut Mission) -> Result<MissionContract> {
        let directive = self.reasoner.directive(request)?;
        if let Some(usage) = directive.usage {
            mission.charge(self.price(usage));
        }
        Ok(directive.contract)
    }

    /// `Some(reason)` when the contract must be re-planned.
    fn audit(&self, request: &PlanRequest, contract: &MissionContract) -> Option<String> {
        if let Err(err) = contract.validate() {
            return Some(err.to_string());
        }
        if self.config.preflight {
            let problems = preflight(
                contract,
                self.workdir,
                &self.config.verification.coverage_command,
            );
            if !problems.is_empty() {
                return Some(format!("preflight failed: {}", problems.join("; ")));
            }
        }
        match self.reasoner.audit(request, contract) {
            Ok(AuditVerdict::Accept) => None,
            Ok(AuditVerdict::Reject { reason }) => Some(reason),
            Err(err) => Some(format!("audit failed: {err:#}")),
        }
    }

    /// Count a refusal. `Some(reason)` once the mission has to stop, otherwise
    /// `feedback` is queued for the next plan.
    fn reject(
        &self,
        mission: &mut Mission,
        feedback: String,
        reason: StopReason,
    ) -> Option<StopReason> {
        mission.rejections += 1;
        match after_rejection(mission.rejections, self.config.max_plan_rejections, reason) {
            RecoveryDecision::Replan => {
                mission.feedback = Some(feedback);
                None
            }
            RecoveryDecision::Stop(stop) => Some(stop),
        }
    }

    fn execute(&self, request: &ExecRequest, limit: Duration) -> Result<Execution> {
        let mut handle = match self.executor.start(request) {
            Ok(handle) => handle,
            Err(err) => {
                let message = format!("{err:#}");
                warn!(err = %message, "agent did not start");
                return Ok(Execution {
                    output: ExecOutput {
                        stderr: message,
                        ..ExecOutput::default()
                    },
                    cancelled: false,
                });
            }
        };
        let deadline = Instant::now() + limit;
        loop {
            if self.cancel.is_cancelled() {
                let output = self.executor.kill(handle)?;
                return Ok(Execution {
                    output,
                    cancelled: true,
                });
            }
            let Some(remaining) = remaining_budget(deadline) else {
                let mut output = self.executor.kill(handle)?;
                output.timed_out = true;
                if !output.stderr.is_empty() && !output.stderr.ends_with('\n') {
                    output.stderr.push('\n');
                }
                output
                    .stderr
                    .push_str(&format!("agent timed out after {}s\n", limit.as_secs()));
                warn!(limit_secs = limit.as_secs(), "agent timed out");
                return Ok(Execution {
                    output,
                    cancelled: false,
                });
            };
            if let Some(output) = self.executor.wait(&mut handle, remaining.min(POLL_SLICE))? {
                return Ok(Execution {
                    output,
                    cancelled: false,
                });
            }
        }
    }

    fn price(&self, usage: TokenUsage) -> f64 {
        pricing_for(&self.config.model, &self.config.pricing).cost(usage)
    }

    fn write_log(&self, task_id: &str, attempt: u32, output: &ExecOutput) {
        let path = self
            .config
            .state_dir_in(self.workdir)
            .join("logs")
            .join(task_id)
            .join(format!("attempt-{attempt}.log"));
        if let Err(err) = write_executor_log(&path, output, self.config.agent.output_limit_bytes) {
            warn!(path = %path.display(), err = %format!("{err:#}"), "cannot write agent log");
        }
    }

    fn record(&self, task_id: &str, attempt: u32, status: RecordStatus) -> MissionRecord {
        MissionRecord {
            task_id: task_id.to_string(),
            attempt,
            timestamp: Utc::now().to_rfc3339(),
            model: self.config.model.clone(),
            contract: None,
            report: None,
            classification: None,
            signals: Vec::new(),
            lesson: None,
            cost: 0.0,
            status,
            stop_reason: None,
            snapshot: None,
            exit_code: None,
            duration_ms: 0,
        }
    }

    /// Terminal failure before anything was executed for this attempt.
    fn stop_unplanned(
        &self,
        mission: &mut Mission,
        contract: Option<MissionContract>,
        reason: StopReason,
    ) -> Result<MissionOutcome> {
        mission.lifecycle.advance(Phase::Failed)?;
        // Refusals mean the goal was unclear; a spent budget keeps the class
        // of the attempt that spent it.
        let classification = match reason {
            StopReason::BudgetExhausted => mission.last_class,
            _ => Some(FailureClass::Ambiguity),
        };
        let cost = mission.take_cost();
        self.memory.append(MissionRecord {
            contract,
            report: mission.last_report.clone(),
            classification,
            cost,
            stop_reason: Some(reason),
            ..self.record(&mission.task_id, mission.attempts + 1, RecordStatus::Failed)
        })?;
        warn!(reason = %reason, rejections = mission.rejections, "mission failed");
        Ok(MissionOutcome::Failed {
            task_id: mission.task_id.clone(),
            attempts: mission.attempts,
            reason,
            classification,
            report: mission.last_report.clone(),
            cost: mission.ledger.spent(),
        })
    }

    /// Record an interruption. The working tree is left as the agent left it.
    fn interrupt(
        &self,
        mission: &mut Mission,
        attempt: u32,
        contract: Option<MissionContract>,
        snapshot: Option<RepositorySnapshot>,
        exit_code: Option<i32>,
        duration_ms: u64,
    ) -> Result<MissionOutcome> {
        mission.lifecycle.advance(Phase::Interrupted)?;
        let cost = mission.take_cost();
        self.memory.append(MissionRecord {
            contract,
            cost,
            snapshot: snapshot.clone(),
            exit_code,
            duration_ms,
            ..self.record(&mission.task_id, attempt, RecordStatus::Interrupted)
        })?;
        warn!(attempts = mission.attempts, "mission interrupted");
        Ok(MissionOutcome::Interrupted {
            task_id: mission.task_id.clone(),
            attempts: mission.attempts,
            snapshot,
        })
    }
}

/// Wall-clock limit for one agent run: the configured timeout, tightened by
/// the contract's duration budget.
fn agent_time_limit(config: &ControllerConfig, contract: &MissionContract) -> Duration {
    let secs = match contract.budget.max_duration_secs {
        Some(budget) => budget.min(config.agent.timeout_secs),
        None => config.agent.timeout_secs,
    };
    Duration::from_secs(secs)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::criteria::Criterion;
    use crate::io::context::NoContext;
    use crate::io::reasoner::Directive;
    use crate::test_support::{ScriptedExecutor, ScriptedReasoner, ScriptedRun, TestRepo, contract};

    fn config() -> ControllerConfig {
        let mut config = ControllerConfig::default();
        config.max_retries = 1;
        config.max_plan_rejections = 1;
        config
    }

    fn exists(path: &str) -> Criterion {
        Criterion::Exists {
            path: path.to_string(),
        }
    }

    #[test]
    fn first_attempt_success_appends_one_completed_record() {
        let repo = TestRepo::new().expect("repo");
        let config = config();
        let memory = MemoryStore::in_memory();
        let executor = ScriptedExecutor::new([ScriptedRun::exit(0).writing("out.txt", "done\n")]);
        let reasoner = ScriptedReasoner::new([contract(vec![exists("out.txt")])]);

        let outcome = MissionController::new(&config, repo.root(), &memory, &executor, &reasoner, &NoContext)
            .run(&MissionRequest::new("write out.txt"))
            .expect("run");

        let MissionOutcome::Succeeded { attempts, report, .. } = &outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(*attempts, 1);
        assert!(report.passed);
        assert_eq!(outcome.exit_code(), exit_codes::OK);

        let records = memory.records().expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RecordStatus::Completed);
        assert_eq!(records[0].task_id, outcome.task_id());
        assert!(records[0].snapshot.is_some());

        let request = &executor.requests()[0];
        assert!(request.instruction.contains("EXISTS `out.txt`"));
        let log = config
            .state_dir_in(repo.root())
            .join("logs")
            .join(outcome.task_id())
            .join("attempt-1.log");
        assert!(log.is_file());
    }

    #[test]
    fn planning_errors_are_bounded() {
        let repo = TestRepo::new().expect("repo");
        let config = config();
        let memory = MemoryStore::in_memory();
        let executor = ScriptedExecutor::default();
        let reasoner = ScriptedReasoner::default()
            .with_directive(Err("reasoner crashed".to_string()))
            .with_directive(Err("reasoner crashed again".to_string()));

        let outcome = MissionController::new(&config, repo.root(), &memory, &executor, &reasoner, &NoContext)
            .run(&MissionRequest::new("anything"))
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
        assert_eq!(reason, StopReason::PlanningError);
        assert_eq!(classification, Some(FailureClass::Ambiguity));
        assert_eq!(attempts, 0);
        assert!(executor.requests().is_empty());

        let requests = reasoner.requests();
        assert_eq!(requests.len(), 2);
        assert!(
            requests[1]
                .feedback
                .as_deref()
                .is_some_and(|feedback| feedback.contains("reasoner crashed"))
        );
        let records = memory.records().expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].stop_reason, Some(StopReason::PlanningError));
    }

    #[test]
    fn rejection_feedback_reaches_the_next_plan_without_consuming_a_retry() {
        let repo = TestRepo::new().expect("repo");
        let mut config = config();
        config.max_retries = 0;
        let memory = MemoryStore::in_memory();
        let executor = ScriptedExecutor::new([ScriptedRun::exit(0).writing("out.txt", "x")]);
        let reasoner = ScriptedReasoner::new([
            contract(vec![exists("elsewhere.txt")]),
            contract(vec![exists("out.txt")]),
        ])
        .with_verdicts([AuditVerdict::Reject {
            reason: "checks the wrong file".to_string(),
        }]);

        let outcome = MissionController::new(&config, repo.root(), &memory, &executor, &reasoner, &NoContext)
            .run(&MissionRequest::new("write out.txt"))
            .expect("run");

        assert!(matches!(outcome, MissionOutcome::Succeeded { attempts: 1, .. }));
        let requests = reasoner.requests();
        assert_eq!(requests[1].feedback.as_deref(), Some("checks the wrong file"));
        assert_eq!(executor.requests().len(), 1);
    }

    #[test]
    fn contract_without_criteria_is_rejected_locally() {
        let repo = TestRepo::new().expect("repo");
        let mut config = config();
        config.max_plan_rejections = 0;
        let memory = MemoryStore::in_memory();
        let executor = ScriptedExecutor::default();
        let reasoner = ScriptedReasoner::new([contract(Vec::new())]);

        let outcome = MissionController::new(&config, repo.root(), &memory, &executor, &reasoner, &NoContext)
            .run(&MissionRequest::new("anything"))
            .expect("run");

        assert!(matches!(
            outcome,
            MissionOutcome::Failed {
                reason: StopReason::PlanRejected,
                ..
            }
        ));
        assert!(executor.requests().is_empty());
    }

    #[test]
    fn agent_timeout_is_tooling() {
        let repo = TestRepo::new().expect("repo");
        let mut config = config();
        config.max_retries = 0;
        config.agent.timeout_secs = 1;
        let memory = MemoryStore::in_memory();
        let executor = ScriptedExecutor::new([ScriptedRun::hanging()]);
        let reasoner = ScriptedReasoner::new([contract(vec![exists("out.txt")])]);

        let outcome = MissionController::new(&config, repo.root(), &memory, &executor, &reasoner, &NoContext)
            .run(&MissionRequest::new("write out.txt"))
            .expect("run");

        let MissionOutcome::Failed {
            reason,
            classification,
            ..
        } = outcome
        else {
            panic!("expected failure");
        };
        assert_eq!(reason, StopReason::RetriesExhausted);
        assert_eq!(classification, Some(FailureClass::Tooling));
    }

    #[test]
    fn agent_that_cannot_start_is_tooling() {
        let repo = TestRepo::new().expect("repo");
        let mut config = config();
        config.max_retries = 0;
        let memory = MemoryStore::in_memory();
        let executor = ScriptedExecutor::new([ScriptedRun {
            start_error: Some("command not found: gemini".to_string()),
            ..ScriptedRun::default()
        }]);
        let reasoner = ScriptedReasoner::new([contract(vec![exists("out.txt")])]);

        MissionController::new(&config, repo.root(), &memory, &executor, &reasoner, &NoContext)
            .run(&MissionRequest::new("write out.txt"))
            .expect("run");

        let records = memory.records().expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].classification, Some(FailureClass::Tooling));
        assert_eq!(records[0].stop_reason, Some(StopReason::RetriesExhausted));
    }

    #[test]
    fn protected_paths_become_a_no_clobber_guardrail() {
        let repo = TestRepo::new().expect("repo");
        let mut config = config();
        config.max_retries = 0;
        config.protected_paths = vec!["README.md".to_string()];
        let memory = MemoryStore::in_memory();
        let executor = ScriptedExecutor::new([ScriptedRun::exit(0)
            .writing("out.txt", "x")
            .writing("README.md", "rewritten\n")]);
        let reasoner = ScriptedReasoner::new([contract(vec![exists("out.txt")])]);

        let outcome = MissionController::new(&config, repo.root(), &memory, &executor, &reasoner, &NoContext)
            .run(&MissionRequest::new("write out.txt"))
            .expect("run");

        assert!(matches!(outcome, MissionOutcome::Failed { .. }));
        let records = memory.records().expect("records");
        let criteria = &records[0].contract.as_ref().expect("contract").criteria;
        assert!(criteria.contains(&Criterion::NoClobber {
            paths: vec!["README.md".to_string()],
        }));
        // Rolled back after the failure.
        let readme = std::fs::read_to_string(repo.root().join("README.md")).expect("readme");
        assert_eq!(readme, "# fixture\n");
        assert!(!repo.root().join("out.txt").exists());
    }

    #[test]
    fn directive_usage_is_charged_to_the_attempt() {
        let repo = TestRepo::new().expect("repo");
        let mut config = config();
        config.agent.cost_per_attempt = 0.25;
        let memory = MemoryStore::in_memory();
        let executor = ScriptedExecutor::new([ScriptedRun::exit(0).writing("out.txt", "x")]);
        let reasoner = ScriptedReasoner::default().with_directive(Ok(Directive {
            contract: contract(vec![exists("out.txt")]),
            usage: Some(TokenUsage {
                input_tokens: 1_000_000,
                output_tokens: 0,
            }),
        }));

        let outcome = MissionController::new(&config, repo.root(), &memory, &executor, &reasoner, &NoContext)
            .run(&MissionRequest::new("write out.txt"))
            .expect("run");

        let MissionOutcome::Succeeded { cost, .. } = outcome else {
            panic!("expected success");
        };
        // gemini-2.0-flash input price plus the flat agent charge.
        assert!((cost - 0.35).abs() < 1e-9, "cost {cost}");
        let records = memory.records().expect("records");
        assert!((records[0].cost - 0.35).abs() < 1e-9);
    }

    #[test]
    fn accepted_contract_is_not_executed_once_planning_spent_the_budget() {
        let repo = TestRepo::new().expect("repo");
        let mut config = config();
        config.cost_budget = Some(0.05);
        let memory = MemoryStore::in_memory();
        let executor = ScriptedExecutor::new([ScriptedRun::exit(0).writing("out.txt", "x")]);
        let reasoner = ScriptedReasoner::default().with_directive(Ok(Directive {
            contract: contract(vec![exists("out.txt")]),
            usage: Some(TokenUsage {
                input_tokens: 1_000_000,
                output_tokens: 0,
            }),
        }));

        let outcome = MissionController::new(&config, repo.root(), &memory, &executor, &reasoner, &NoContext)
            .run(&MissionRequest::new("write out.txt"))
            .expect("run");

        let MissionOutcome::Failed {
            reason,
            attempts,
            classification,
            ..
        } = outcome
        else {
            panic!("expected failure");
        };
        assert_eq!(reason, StopReason::BudgetExhausted);
        assert_eq!(attempts, 0);
        assert_eq!(classification, None);
        assert!(executor.requests().is_empty());
        let records = memory.records().expect("records");
        assert_eq!(records.len(), 1);
        assert!(records[0].contract.is_some());
    }

    #[test]
    fn contract_needing_a_missing_tool_is_replanned() {
        let repo = TestRepo::new().expect("repo");
        let config = config();
        let memory = MemoryStore::in_memory();
        let executor = ScriptedExecutor::new([ScriptedRun::exit(0).writing("out.txt", "x")]);
        let reasoner = ScriptedReasoner::new([
            contract(vec![Criterion::Command {
                cmd: vec!["not-installed-checker-7719".to_string()],
                timeout_secs: None,
            }]),
            contract(vec![exists("out.txt")]),
        ]);

        let outcome = MissionController::new(&config, repo.root(), &memory, &executor, &reasoner, &NoContext)
            .run(&MissionRequest::new("write out.txt"))
            .expect("run");

        assert!(matches!(outcome, MissionOutcome::Succeeded { attempts: 1, .. }));
        let feedback = reasoner.requests()[1].feedback.clone().unwrap_or_default();
        assert!(feedback.starts_with("preflight failed: COMMAND"), "{feedback}");
        assert!(feedback.contains("not-installed-checker-7719"));
    }

    #[test]
    fn project_rules_reach_the_reasoner_and_the_agent() {
        let repo = TestRepo::new().expect("repo");
        repo.write(".loopguard/rules.md", "- Never touch CI.\n").expect("rules");
        let config = config();
        let memory = MemoryStore::in_memory();
        let executor = ScriptedExecutor::new([ScriptedRun::exit(0).writing("out.txt", "x")]);
        let reasoner = ScriptedReasoner::new([contract(vec![exists("out.txt")])]);

        MissionController::new(&config, repo.root(), &memory, &executor, &reasoner, &NoContext)
            .run(&MissionRequest::new("write out.txt"))
            .expect("run");

        assert_eq!(reasoner.requests()[0].rules.as_deref(), Some("- Never touch CI."));
        let instruction = &executor.requests()[0].instruction;
        assert!(instruction.contains("## Project rules\n\n- Never touch CI."), "{instruction}");
    }

    #[test]
    fn dry_run_plans_without_executing() {
        let repo = TestRepo::new().expect("repo");
        let config = config();
        let memory = MemoryStore::in_memory();
        let executor = ScriptedExecutor::default();
        let reasoner = ScriptedReasoner::new([contract(vec![exists("out.txt")])]);

        let dry = MissionController::new(&config, repo.root(), &memory, &executor, &reasoner, &NoContext)
            .dry_run(&MissionRequest::new("write out.txt"))
            .expect("dry run");

        let DryRun::Ready {
            contract,
            instruction,
        } = &dry
        else {
            panic!("expected a ready contract, got {dry:?}");
        };
        assert_eq!(contract.criteria, vec![exists("out.txt")]);
        assert!(instruction.starts_with("# Mission\n"));
        assert!(executor.requests().is_empty());
        assert!(memory.records().expect("records").is_empty());
        assert!(!config.state_dir_in(repo.root()).join("logs").exists());
    }

    #[test]
    fn task_ids_are_prefixed_and_unique() {
        let a = generate_task_id();
        let b = generate_task_id();
        assert!(a.starts_with("task_"));
        assert_eq!(a.rsplit('_').next().map(str::len), Some(6));
        assert_ne!(a, b);
    }
}
