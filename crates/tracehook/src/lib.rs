//! Tracehook - Non-invasive span tracing for workflow execution frameworks
//!
//! This crate turns the execution of an existing graph/agent framework into a
//! hierarchy of spans without modifying its source:
//! - Lifecycle control: patch and restore framework entry points atomically
//! - Event tracing: one span per unit of work, with status, errors and state
//! - Context propagation: per-thread and per-task active-span stacks
//! - Bounded state capture with truncation markers
//! - Execution-scoped session identifiers
//! - Pluggable exporters (console, in-memory, batched async backends)
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tracehook::{EventTracer, InMemoryExporter, TracerConfig, UnitMetadata};
//!
//! let exporter = Arc::new(InMemoryExporter::new());
//! let tracer = EventTracer::new(TracerConfig::new("my-service"), exporter.clone());
//!
//! tracehook::set_session_context("session-42", None);
//! let answer: Result<u32, std::io::Error> =
//!     tracer.trace(&UnitMetadata::new("plan_step"), &"question", || Ok(42));
//!
//! assert_eq!(answer.unwrap(), 42);
//! assert_eq!(exporter.len(), 1);
//! ```

pub mod attributes;
mod capture;
mod classify;
mod context;
mod error;
mod exporter;
mod instrument;
pub mod propagator;
mod registry;
mod session;
mod span;
mod tracer;

pub use capture::{
    DEFAULT_MAX_STATE_SIZE, JSON_MIME_TYPE, JsonSerializer, StateSerializer, StateSnapshot,
    TruncationMarker, capture, capture_with,
};
pub use classify::{NAME_RULES, UNIT_TYPE_RULES, UnitMetadata, classify};
pub use context::{SpanId, SpanRef, TraceId};
pub use error::{
    ExportError, ExportResult, InstrumentationError, InstrumentationResult, PatchError,
};
pub use exporter::{
    BatchSpanExporter, CompositeExporter, ConsoleExporter, ExporterConfig, InMemoryExporter,
    SpanExporter, TracingExporter,
};
pub use instrument::{
    ENV_CAPTURE_INPUT, ENV_CAPTURE_STATE, ENV_MAX_STATE_SIZE, ENV_SERVICE_NAME, HookSlot,
    InstrumentOptions, InstrumentationController, Instrumentor, Patch, PatchRecord, SlotPatch,
    instrumented_targets,
};
pub use propagator::{
    ContextGuard, ExecutionContext, is_suppressed, suppress_instrumentation,
    suppress_instrumentation_async,
};
pub use registry::{RunRegistry, RunRegistryConfig};
pub use session::{
    SessionContext, clear_session_context, get_session_context, session_id,
    set_session_context, thread_id,
};
pub use span::{
    EXCEPTION_EVENT, EXCEPTION_MESSAGE, EXCEPTION_STACKTRACE, EXCEPTION_TYPE, Span,
    SpanAttribute, SpanData, SpanEvent, SpanKind, SpanStatus,
};
pub use tracer::{ActiveUnit, EventTracer, TracerConfig, UnitState};
