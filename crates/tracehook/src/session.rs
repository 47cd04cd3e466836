//! Session context store.
//!
//! Session and thread identifiers are execution-scoped: they live inside the
//! current [`ExecutionContext`](crate::propagator::ExecutionContext) and are
//! copied into children when a task or thread is forked from it. An unset
//! identifier reads as `None`, which keeps "no session" distinguishable from
//! a session that was explicitly set to the empty string.

use crate::propagator;
use serde::{Deserialize, Serialize};

/// Session identifiers attached to one execution context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: Option<String>,
    pub thread_id: Option<String>,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            thread_id: None,
        }
    }

    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.session_id.is_none() && self.thread_id.is_none()
    }

    /// Apply a `set` call. A missing thread id keeps the previous one.
    pub(crate) fn set(&mut self, session_id: String, thread_id: Option<String>) {
        self.session_id = Some(session_id);
        if let Some(thread_id) = thread_id {
            self.thread_id = Some(thread_id);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.session_id = None;
        self.thread_id = None;
    }
}

/// Set the session context for every span started in the current execution
/// context from now on.
pub fn set_session_context(session_id: impl Into<String>, thread_id: Option<String>) {
    let session_id = session_id.into();
    propagator::with_current(|ctx| ctx.session.set(session_id, thread_id));
}

/// Current session context of this execution context.
pub fn get_session_context() -> SessionContext {
    propagator::with_current(|ctx| ctx.session.clone())
}

pub fn session_id() -> Option<String> {
    propagator::with_current(|ctx| ctx.session.session_id.clone())
}

pub fn thread_id() -> Option<String> {
    propagator::with_current(|ctx| ctx.session.thread_id.clone())
}

/// Clear both identifiers in the current execution context.
pub fn clear_session_context() {
    propagator::with_current(|ctx| ctx.session.clear());
}
