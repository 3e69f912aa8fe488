//! Typed lifecycle events for observing a run.
//!
//! Everything here is optional: the executor and stages work without an
//! event handler, and all of these moments are also logged through
//! `tracing`. Implement [`EventHandler`] when a program needs to react to
//! them directly (progress bars, test assertions, metrics).

use crate::graph::{StageId, Target};
use crate::parser::ParseTier;
use std::sync::Arc;

/// Events emitted while a request moves through the workflow.
#[derive(Debug, Clone)]
pub enum Event {
    /// A stage is about to run.
    StageStart {
        stage: StageId,
        /// 1-based position in the run.
        step: usize,
    },
    /// A stage returned.
    StageEnd { stage: StageId, ok: bool },
    /// A conditional or fixed edge was followed.
    Routed { from: StageId, to: Target },
    /// Validation sent the run back to generation.
    Regenerate { attempt: u32, issues: Vec<String> },
    /// A stage reply needed more than strict decoding.
    ParseFallback { stage: StageId, tier: ParseTier },
    /// A transport-level retry of a text-generation call.
    TransportRetry {
        stage: StageId,
        /// 1-based retry number.
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    /// The run stopped before reaching the end.
    StepCeiling { steps: usize, reason: String },
}

/// Receiver for [`Event`]s.
///
/// # Example
///
/// ```
/// use sql_agent::events::{Event, EventHandler};
///
/// struct PrintHandler;
///
/// impl EventHandler for PrintHandler {
///     fn on_event(&self, event: Event) {
///         match event {
///             Event::StageStart { stage, step } => println!("[{step}] {stage}"),
///             Event::Routed { from, to } => println!("{from} -> {to}"),
///             _ => {}
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: Event);
}

/// Emit an event if a handler is present. No-op otherwise.
pub(crate) fn emit(handler: &Option<Arc<dyn EventHandler>>, event: Event) {
    if let Some(ref h) = handler {
        h.on_event(event);
    }
}

/// An [`EventHandler`] backed by a closure.
///
/// ```
/// use sql_agent::events::{Event, FnEventHandler};
/// use std::sync::Arc;
///
/// let handler = Arc::new(FnEventHandler(|event: Event| {
///     if let Event::Regenerate { attempt, .. } = event {
///         eprintln!("regeneration #{attempt}");
///     }
/// }));
/// ```
pub struct FnEventHandler<F: Fn(Event) + Send + Sync>(pub F);

impl<F: Fn(Event) + Send + Sync> EventHandler for FnEventHandler<F> {
    fn on_event(&self, event: Event) {
        (self.0)(event);
    }
}
