use std::cell::Cell;
use std::rc::Rc;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum FlushState {
    #[default]
    Idle,
    Flushing,
}

/// Keeps a dataset flush from being re-entered.
#[derive(Debug, Default)]
pub(crate) struct FlushGate {
    state: Cell<FlushState>,
}

impl FlushGate {
    pub(crate) fn state(&self) -> FlushState {
        self.state.get()
    }

    /// `None` when a flush is already running.
    pub(crate) fn enter(gate: &Rc<FlushGate>) -> Option<FlushGuard> {
        if gate.state.get() == FlushState::Flushing {
            return None;
        }
        gate.state.set(FlushState::Flushing);
        Some(FlushGuard {
            gate: Rc::clone(gate),
        })
    }
}

/// Returns the gate to `Idle` when dropped.
#[derive(Debug)]
pub(crate) struct FlushGuard {
    gate: Rc<FlushGate>,
}

impl Drop for FlushGuard {
    fn drop(&mut self) {
        self.gate.state.set(FlushState::Idle);
    }
}
