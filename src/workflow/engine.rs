use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{WorkflowContext, WorkflowError};

pub const SUCCESS: &str = "SUCCESS";
pub const FAILED: &str = "FAILED";

/// Guard against definitions that loop without reaching a terminal state.
const MAX_TRANSITIONS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failed,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

// ── Definition tables ───────────────────────────────────────────

/// One row of a workflow table.
#[derive(Debug, Clone)]
pub struct StateNode {
    pub name: &'static str,
    /// Service run on entry. Its result picks `on_done` or `on_error`.
    pub invoke: Option<&'static str>,
    pub on_done: Option<&'static str>,
    pub on_error: Option<&'static str>,
    /// Event transitions for states that wait for a trigger.
    pub on: Vec<(&'static str, &'static str)>,
    pub terminal: Option<Outcome>,
    /// Prefix for `error_message` when the service fails.
    pub failure_message: Option<&'static str>,
}

impl StateNode {
    fn bare(name: &'static str) -> Self {
        Self {
            name,
            invoke: None,
            on_done: None,
            on_error: None,
            on: Vec::new(),
            terminal: None,
            failure_message: None,
        }
    }

    /// A state that waits for an event.
    pub fn idle(name: &'static str) -> Self {
        Self::bare(name)
    }

    /// A state that runs `service` and moves on.
    pub fn invoke(name: &'static str, service: &'static str) -> Self {
        Self {
            invoke: Some(service),
            ..Self::bare(name)
        }
    }

    pub fn success() -> Self {
        Self {
            terminal: Some(Outcome::Success),
            ..Self::bare(SUCCESS)
        }
    }

    pub fn failed() -> Self {
        Self {
            terminal: Some(Outcome::Failed),
            ..Self::bare(FAILED)
        }
    }

    #[must_use]
    pub fn done(mut self, target: &'static str) -> Self {
        self.on_done = Some(target);
        self
    }

    #[must_use]
    pub fn error(mut self, target: &'static str) -> Self {
        self.on_error = Some(target);
        self
    }

    #[must_use]
    pub fn on(mut self, event: &'static str, target: &'static str) -> Self {
        self.on.push((event, target));
        self
    }

    #[must_use]
    pub fn failure(mut self, message: &'static str) -> Self {
        self.failure_message = Some(message);
        self
    }

    fn event_target(&self, event: &str) -> Option<&'static str> {
        self.on
            .iter()
            .find(|(name, _)| *name == event)
            .map(|(_, target)| *target)
    }
}

/// Immutable state table for one workflow.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub name: &'static str,
    pub initial: &'static str,
    pub states: Vec<StateNode>,
}

impl WorkflowDefinition {
    pub fn new(name: &'static str, initial: &'static str, states: Vec<StateNode>) -> Self {
        Self {
            name,
            initial,
            states,
        }
    }

    pub fn state(&self, name: &str) -> Option<&StateNode> {
        self.states.iter().find(|s| s.name == name)
    }

    /// Events accepted by the initial state.
    pub fn trigger_events(&self) -> Vec<&'static str> {
        self.state(self.initial)
            .map(|s| s.on.iter().map(|(event, _)| *event).collect())
            .unwrap_or_default()
    }

    /// Check that every edge lands on a known state and every service has a
    /// way out to FAILED.
    pub fn validate(&self) -> Result<(), String> {
        let exists = |name: &str| self.state(name).is_some();

        if !exists(self.initial) {
            return Err(format!("initial state {} is not defined", self.initial));
        }
        if self.state(SUCCESS).and_then(|s| s.terminal) != Some(Outcome::Success) {
            return Err(format!("{SUCCESS} must be a success terminal"));
        }
        if self.state(FAILED).and_then(|s| s.terminal) != Some(Outcome::Failed) {
            return Err(format!("{FAILED} must be a failed terminal"));
        }

        for (i, state) in self.states.iter().enumerate() {
            if self.states[..i].iter().any(|s| s.name == state.name) {
                return Err(format!("state {} is defined twice", state.name));
            }
            if state.terminal.is_some() {
                continue;
            }

            let targets = state
                .on_done
                .iter()
                .chain(state.on_error.iter())
                .chain(state.on.iter().map(|(_, target)| target));
            for target in targets {
                if !exists(target) {
                    return Err(format!("{} targets unknown state {target}", state.name));
                }
            }

            if state.invoke.is_some() {
                if state.on_done.is_none() {
                    return Err(format!("{} invokes a service without a done edge", state.name));
                }
                let error_terminal = state
                    .on_error
                    .and_then(|target| self.state(target))
                    .and_then(|s| s.terminal);
                if error_terminal != Some(Outcome::Failed) {
                    return Err(format!("{} must route errors to {FAILED}", state.name));
                }
            } else if state.on.is_empty() {
                return Err(format!("{} has no way out", state.name));
            }
        }
        Ok(())
    }
}

// ── Services ────────────────────────────────────────────────────

/// Work behind the named services of a definition.
#[async_trait]
pub trait WorkflowServices<C: WorkflowContext>: Send + Sync {
    /// Run `service`. An error takes the state's error edge.
    async fn invoke(&self, service: &str, ctx: &mut C) -> Result<(), WorkflowError>;

    /// Entry action for SUCCESS and FAILED.
    async fn on_terminal(&self, state: &'static str, outcome: Outcome, ctx: &mut C);
}

/// Result of driving a context to a terminal state.
#[derive(Debug)]
pub struct WorkflowRun<C> {
    pub context: C,
    /// Every state entered, in order, starting with the initial state.
    pub history: Vec<&'static str>,
    pub outcome: Outcome,
}

impl<C> WorkflowRun<C> {
    pub fn final_state(&self) -> &'static str {
        self.history.last().copied().unwrap_or(FAILED)
    }
}

// ── Interpreter ─────────────────────────────────────────────────

/// Interprets a [`WorkflowDefinition`].
pub struct WorkflowEngine<'a> {
    definition: &'a WorkflowDefinition,
}

impl<'a> WorkflowEngine<'a> {
    pub fn new(definition: &'a WorkflowDefinition) -> Self {
        Self { definition }
    }

    /// Start at the initial state, deliver `event`, and run until terminal.
    ///
    /// An event the initial state does not accept is rejected before any
    /// service runs.
    pub async fn run<C, S>(
        &self,
        services: &S,
        mut ctx: C,
        event: &str,
    ) -> Result<WorkflowRun<C>, WorkflowError>
    where
        C: WorkflowContext,
        S: WorkflowServices<C> + ?Sized,
    {
        let def = self.definition;
        let mut current = def
            .state(def.initial)
            .ok_or_else(|| WorkflowError::Definition(format!("missing {}", def.initial)))?;

        if current.invoke.is_none()
            && current.terminal.is_none()
            && current.event_target(event).is_none()
        {
            return Err(WorkflowError::InvalidEvent {
                event: event.to_string(),
                state: current.name.to_string(),
            });
        }

        let mut pending_event = Some(event);
        let mut history = vec![current.name];
        info!(
            "{} started for session {} ({event})",
            def.name,
            ctx.session_id()
        );

        loop {
            if let Some(outcome) = current.terminal {
                if outcome == Outcome::Failed && ctx.report().error_message.is_empty() {
                    ctx.report_mut().fail(format!("{} failed", def.name));
                }
                services.on_terminal(current.name, outcome, &mut ctx).await;
                info!(
                    "{} finished for session {}: {}",
                    def.name,
                    ctx.session_id(),
                    current.name
                );
                return Ok(WorkflowRun {
                    context: ctx,
                    history,
                    outcome,
                });
            }

            if history.len() > MAX_TRANSITIONS {
                return Err(WorkflowError::Definition(format!(
                    "{} exceeded {MAX_TRANSITIONS} transitions",
                    def.name
                )));
            }

            let target = match current.invoke {
                Some(service) => match services.invoke(service, &mut ctx).await {
                    Ok(()) => current.on_done,
                    Err(err) => {
                        warn!(
                            "{} {} failed for session {}: {err}",
                            def.name,
                            current.name,
                            ctx.session_id()
                        );
                        let message = match current.failure_message {
                            Some(prefix) => format!("{prefix}: {err}"),
                            None => err.to_string(),
                        };
                        ctx.report_mut().fail(message);
                        current.on_error.or(Some(FAILED))
                    }
                },
                None => {
                    let event = pending_event.take().unwrap_or_default();
                    match current.event_target(event) {
                        Some(target) => Some(target),
                        None => {
                            return Err(WorkflowError::InvalidEvent {
                                event: event.to_string(),
                                state: current.name.to_string(),
                            })
                        }
                    }
                }
            };

            let target = target.ok_or_else(|| {
                WorkflowError::Definition(format!("{} has no outgoing edge", current.name))
            })?;
            current = def
                .state(target)
                .ok_or_else(|| WorkflowError::Definition(format!("unknown state {target}")))?;
            debug!("{} -> {}", history.last().copied().unwrap_or_default(), target);
            history.push(current.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::StatusReport;
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct TestContext {
        report: StatusReport,
        visited: Vec<String>,
    }

    impl WorkflowContext for TestContext {
        fn session_id(&self) -> &str {
            "s1"
        }

        fn report(&self) -> &StatusReport {
            &self.report
        }

        fn report_mut(&mut self) -> &mut StatusReport {
            &mut self.report
        }
    }

    /// Services that fail any service named in `failing`.
    struct Scripted {
        failing: Vec<&'static str>,
        terminals: Mutex<Vec<(&'static str, Outcome)>>,
    }

    impl Scripted {
        fn new(failing: Vec<&'static str>) -> Self {
            Self {
                failing,
                terminals: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl WorkflowServices<TestContext> for Scripted {
        async fn invoke(&self, service: &str, ctx: &mut TestContext) -> Result<(), WorkflowError> {
            ctx.visited.push(service.to_string());
            if self.failing.iter().any(|f| *f == service) {
                return Err(WorkflowError::Validation(format!("{service} broke")));
            }
            ctx.report.succeed(format!("{service} ok"));
            Ok(())
        }

        async fn on_terminal(&self, state: &'static str, outcome: Outcome, _ctx: &mut TestContext) {
            self.terminals.lock().push((state, outcome));
        }
    }

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition::new(
            "test",
            "IDLE",
            vec![
                StateNode::idle("IDLE").on("GO", "FIRST"),
                StateNode::invoke("FIRST", "first")
                    .done("SECOND")
                    .error(FAILED)
                    .failure("First step failed"),
                StateNode::invoke("SECOND", "second").done(SUCCESS).error(FAILED),
                StateNode::success(),
                StateNode::failed(),
            ],
        )
    }

    #[test]
    fn definition_validates() {
        definition().validate().unwrap();
        assert_eq!(definition().trigger_events(), vec!["GO"]);
    }

    #[test]
    fn validation_catches_bad_tables() {
        let dangling = WorkflowDefinition::new(
            "bad",
            "IDLE",
            vec![
                StateNode::idle("IDLE").on("GO", "NOWHERE"),
                StateNode::success(),
                StateNode::failed(),
            ],
        );
        assert!(dangling.validate().unwrap_err().contains("NOWHERE"));

        let no_error_edge = WorkflowDefinition::new(
            "bad",
            "IDLE",
            vec![
                StateNode::idle("IDLE").on("GO", "STEP"),
                StateNode::invoke("STEP", "step").done(SUCCESS),
                StateNode::success(),
                StateNode::failed(),
            ],
        );
        assert!(no_error_edge.validate().unwrap_err().contains("FAILED"));

        let missing_terminal = WorkflowDefinition::new(
            "bad",
            "IDLE",
            vec![StateNode::idle("IDLE").on("GO", SUCCESS), StateNode::success()],
        );
        assert!(missing_terminal.validate().is_err());
    }

    #[tokio::test]
    async fn happy_path_reaches_success() {
        let def = definition();
        let services = Scripted::new(vec![]);
        let run = WorkflowEngine::new(&def)
            .run(&services, TestContext::default(), "GO")
            .await
            .unwrap();

        assert_eq!(run.history, vec!["IDLE", "FIRST", "SECOND", SUCCESS]);
        assert_eq!(run.outcome, Outcome::Success);
        assert_eq!(run.final_state(), SUCCESS);
        assert_eq!(run.context.visited, vec!["first", "second"]);
        assert_eq!(*services.terminals.lock(), vec![(SUCCESS, Outcome::Success)]);
    }

    #[tokio::test]
    async fn failure_stops_further_services() {
        let def = definition();
        let services = Scripted::new(vec!["first"]);
        let run = WorkflowEngine::new(&def)
            .run(&services, TestContext::default(), "GO")
            .await
            .unwrap();

        assert_eq!(run.history, vec!["IDLE", "FIRST", FAILED]);
        assert_eq!(run.outcome, Outcome::Failed);
        assert_eq!(run.context.visited, vec!["first"]);
        assert!(run.context.report.is_error());
        assert_eq!(run.context.report.error_message, "First step failed: first broke");
        assert_eq!(*services.terminals.lock(), vec![(FAILED, Outcome::Failed)]);
    }

    #[tokio::test]
    async fn failure_without_prefix_uses_error_text() {
        let def = definition();
        let services = Scripted::new(vec!["second"]);
        let run = WorkflowEngine::new(&def)
            .run(&services, TestContext::default(), "GO")
            .await
            .unwrap();
        assert_eq!(run.context.report.error_message, "second broke");
    }

    #[tokio::test]
    async fn unknown_event_is_rejected_before_any_work() {
        let def = definition();
        let services = Scripted::new(vec![]);
        let err = WorkflowEngine::new(&def)
            .run(&services, TestContext::default(), "STOP")
            .await
            .unwrap_err();

        assert!(matches!(err, WorkflowError::InvalidEvent { ref event, .. } if event == "STOP"));
        assert!(services.terminals.lock().is_empty());
    }
}
