//! A submitted sequence bound to its host, cancellation token and handle.

use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::host::{Frame, Host};
use crate::tracing_compat::debug;
use crate::types::{CancelReason, Outcome, PanicPayload, RunId};

use super::completion::Completer;
use super::interpreter::{Drive, Interpreter};
use super::BoxSequence;

/// A run owned by the affinity dispatcher and pumped once per tick.
pub(crate) trait PumpedRun: Send {
    /// The run's id.
    fn id(&self) -> RunId;

    /// Drives the run for tick `tick`. Returns true once it has finished.
    fn pump(&mut self, tick: u64, step_budget: usize) -> bool;

    /// Ends the run without taking another step.
    fn cancel(&mut self, reason: CancelReason);

    /// Ends the run after a panic escaped [`pump`](Self::pump).
    fn panicked(&mut self, payload: PanicPayload);
}

pub(crate) struct SequenceRun<T> {
    id: RunId,
    interpreter: Interpreter<T>,
    host: Arc<dyn Host>,
    cancel: CancelToken,
    completer: Option<Completer<T>>,
}

impl<T: Clone + Send + 'static> SequenceRun<T> {
    pub(crate) fn new(
        id: RunId,
        root: BoxSequence<T>,
        host: Arc<dyn Host>,
        cancel: CancelToken,
        completer: Completer<T>,
    ) -> Self {
        Self {
            id,
            interpreter: Interpreter::new(root),
            host,
            cancel,
            completer: Some(completer),
        }
    }

    fn finish(&mut self, outcome: Outcome<T, crate::error::Error>) {
        if let Some(completer) = self.completer.take() {
            debug!(
                run_id = ?self.id,
                steps = self.interpreter.steps(),
                max_depth = self.interpreter.max_depth(),
                "sequence run finished"
            );
            completer.complete(outcome);
        }
    }
}

impl<T: Clone + Send + 'static> PumpedRun for SequenceRun<T> {
    fn id(&self) -> RunId {
        self.id
    }

    fn pump(&mut self, tick: u64, step_budget: usize) -> bool {
        let Some(completer) = self.completer.as_ref() else {
            return true;
        };
        let frame = Frame::new(tick, self.host.now());
        let cancel = &self.cancel;
        let stop = || {
            if completer.is_aborted() {
                Some(CancelReason::aborted())
            } else {
                cancel.reason()
            }
        };

        let outcome = match self
            .interpreter
            .drive(self.host.as_ref(), &frame, step_budget, &stop)
        {
            Drive::Paused | Drive::Waiting => return false,
            Drive::Completed(value) => Outcome::Ok(value),
            Drive::Failed(err) => Outcome::Err(err),
            Drive::Panicked(payload) => Outcome::Panicked(payload),
            Drive::Cancelled(reason) => Outcome::Cancelled(reason),
        };
        self.finish(outcome);
        true
    }

    fn cancel(&mut self, reason: CancelReason) {
        self.finish(Outcome::Cancelled(reason));
    }

    fn panicked(&mut self, payload: PanicPayload) {
        self.finish(Outcome::Panicked(payload));
    }
}
