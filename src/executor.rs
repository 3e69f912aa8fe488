//! Runs a [`WorkflowGraph`] for one request.
//!
//! The executor owns no per-request data; [`WorkflowExecutor::invoke`] and
//! [`WorkflowExecutor::stream`] each drive their own run cursor, so one
//! executor can serve any number of concurrent requests.
//!
//! A run ends normally when routing reaches the end marker, or early when
//! the step ceiling or the deadline is hit. Early stops are not errors: the
//! last state comes back with `error` set. Only a schema failure or
//! cancellation produces `Err`.

use crate::context::StageCtx;
use crate::error::{AgentError, Result};
use crate::events::Event;
use crate::graph::{Target, WorkflowGraph};
use crate::routing::RetryPolicy;
use crate::stages::StageSet;
use crate::state::RequestState;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Drives request states through the workflow graph.
///
/// Cheap to clone; clones share the graph, stages and context.
#[derive(Clone)]
pub struct WorkflowExecutor {
    graph: Arc<WorkflowGraph>,
    stages: Arc<StageSet>,
    ctx: Arc<StageCtx>,
}

impl std::fmt::Debug for WorkflowExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowExecutor")
            .field("entry", &self.graph.entry())
            .field("stages", &self.stages)
            .field("ctx", &self.ctx)
            .finish()
    }
}

impl WorkflowExecutor {
    /// The standard workflow with every built-in stage.
    pub fn new(ctx: StageCtx) -> Result<Self> {
        Self::from_shared(Arc::new(ctx))
    }

    pub fn from_shared(ctx: Arc<StageCtx>) -> Result<Self> {
        let policy = RetryPolicy::new(ctx.config.max_regenerate_attempts);
        let graph = WorkflowGraph::sql_agent(policy)?;
        Self::with_parts(ctx, graph, StageSet::standard())
    }

    /// A custom graph and stage set. Fails if the graph names a stage that
    /// `stages` does not implement.
    pub fn with_parts(ctx: Arc<StageCtx>, graph: WorkflowGraph, stages: StageSet) -> Result<Self> {
        if let Some(missing) = graph.stages().find(|id| !stages.contains(*id)) {
            return Err(AgentError::InvalidGraph(format!(
                "stage {missing} has no implementation"
            )));
        }
        Ok(Self {
            graph: Arc::new(graph),
            stages: Arc::new(stages),
            ctx,
        })
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    pub fn context(&self) -> &StageCtx {
        &self.ctx
    }

    /// Run to completion and return the final state.
    #[instrument(skip_all, fields(run_id = %state.run_id, session_id = %state.session_id))]
    pub async fn invoke(&self, state: RequestState) -> Result<RequestState> {
        let mut run = Run::new(self.clone(), state);
        while let Progress::Ran = run.step().await? {}
        let state = run.into_state()?;
        info!(
            steps = state.steps(),
            regenerations = state.regenerate_attempts.len(),
            halted = state.error.is_some(),
            "run finished"
        );
        Ok(state)
    }

    /// Run lazily, yielding a snapshot after each stage.
    ///
    /// Snapshots arrive in execution order, retry iterations included. An
    /// early stop yields one more item carrying the annotated state. An
    /// `Err` item ends the stream.
    pub fn stream(&self, state: RequestState) -> BoxStream<'static, Result<RequestState>> {
        let run = Run::new(self.clone(), state);
        stream::unfold(Some(run), |run| async move {
            let mut run = run?;
            match run.step().await {
                Ok(Progress::Ran) => {
                    let snapshot = run.snapshot();
                    Some((snapshot, Some(run)))
                }
                Ok(Progress::Halted) => Some((run.into_state(), None)),
                Ok(Progress::Finished) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed()
    }
}

/// Outcome of one [`Run::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    /// A stage ran and routing picked the next target.
    Ran,
    /// Step ceiling or deadline reached; the state carries the reason.
    Halted,
    /// Routing reached the end marker.
    Finished,
}

/// Cursor over one request's path through the graph.
struct Run {
    exec: WorkflowExecutor,
    state: Option<RequestState>,
    next: Target,
    started: Instant,
}

impl Run {
    fn new(exec: WorkflowExecutor, state: RequestState) -> Self {
        let next = Target::Stage(exec.graph.entry());
        Self {
            exec,
            state: Some(state),
            next,
            started: Instant::now(),
        }
    }

    fn current(&mut self) -> Result<&mut RequestState> {
        self.state
            .as_mut()
            .ok_or_else(|| AgentError::Other("run state already consumed".into()))
    }

    fn snapshot(&mut self) -> Result<RequestState> {
        self.current().map(|s| s.clone())
    }

    fn into_state(mut self) -> Result<RequestState> {
        self.state
            .take()
            .ok_or_else(|| AgentError::Other("run state already consumed".into()))
    }

    /// Why the run must stop before the next stage, if it must.
    fn limit_reached(&mut self) -> Result<Option<String>> {
        let config = &self.exec.ctx.config;
        let ceiling = config.step_ceiling;
        let deadline = config.deadline();
        let elapsed = self.started.elapsed();
        let steps = self.current()?.steps();

        if steps >= ceiling {
            return Ok(Some(format!(
                "step ceiling of {ceiling} reached before the run finished"
            )));
        }
        if let Some(deadline) = deadline {
            if elapsed >= deadline {
                return Ok(Some(format!(
                    "deadline of {} ms exceeded after {steps} steps",
                    deadline.as_millis()
                )));
            }
        }
        Ok(None)
    }

    async fn step(&mut self) -> Result<Progress> {
        let stage_id = match self.next {
            Target::End => return Ok(Progress::Finished),
            Target::Stage(id) => id,
        };
        let ctx = self.exec.ctx.clone();
        ctx.check_cancelled()?;

        if let Some(reason) = self.limit_reached()? {
            let state = self.current()?;
            warn!(steps = state.steps(), %reason, "stopping run early");
            ctx.emit(Event::StepCeiling {
                steps: state.steps(),
                reason: reason.clone(),
            });
            state.error = Some(reason);
            self.next = Target::End;
            return Ok(Progress::Halted);
        }

        let stage = self
            .exec
            .stages
            .get(stage_id)
            .cloned()
            .ok_or_else(|| AgentError::InvalidGraph(format!("stage {stage_id} has no implementation")))?;
        let state = self
            .state
            .take()
            .ok_or_else(|| AgentError::Other("run state already consumed".into()))?;
        let step = state.steps() + 1;

        debug!(stage = %stage_id, step, "stage starting");
        ctx.emit(Event::StageStart { stage: stage_id, step });

        let mut state = match stage.run(&ctx, state).await {
            Ok(state) => state,
            Err(e) => {
                warn!(stage = %stage_id, error = %e, "stage aborted the run");
                ctx.emit(Event::StageEnd {
                    stage: stage_id,
                    ok: false,
                });
                self.next = Target::End;
                return Err(e);
            }
        };
        state.trace.push(stage_id);
        ctx.emit(Event::StageEnd {
            stage: stage_id,
            ok: true,
        });

        let attempts_before = state.regenerate_attempts.len();
        let next = self.exec.graph.next(stage_id, &mut state)?;
        if state.regenerate_attempts.len() > attempts_before {
            if let Some(latest) = state.regenerate_attempts.last() {
                ctx.emit(Event::Regenerate {
                    attempt: latest.attempt,
                    issues: latest.issues.clone(),
                });
            }
        }
        debug!(from = %stage_id, to = %next, "routed");
        ctx.emit(Event::Routed { from: stage_id, to: next });

        self.next = next;
        self.state = Some(state);
        Ok(Progress::Ran)
    }
}
