//! Span attribute keys shared by the tracer and exporters.

pub const SPAN_KIND: &str = "openinference.span.kind";
pub const NODE_NAME: &str = "node.name";
pub const SERVICE_NAME: &str = "service.name";

pub const INPUT_VALUE: &str = "input.value";
pub const INPUT_MIME_TYPE: &str = "input.mime_type";
pub const OUTPUT_VALUE: &str = "output.value";
pub const OUTPUT_MIME_TYPE: &str = "output.mime_type";

pub const RUN_ID: &str = "run.id";
pub const PARENT_RUN_ID: &str = "run.parent_id";
pub const TAGS: &str = "tags";

/// Session identifier set through `set_session_context`.
pub const SESSION_ID: &str = "session.id";
/// Thread or conversation identifier paired with the session.
pub const THREAD_ID: &str = "thread_id";
