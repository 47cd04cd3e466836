//! Tracehook Testing Utilities
//!
//! Provides a small host framework with patchable entry points, an
//! instrumentor for it, and a recording exporter, so instrumentation can be
//! exercised end to end without a real workflow engine.


pub use exporter::RecordingExporter;
pub use graph::{MockFramework, MockGraph, MockGraphBuilder, NodeError, NodeResult};
pub use harness::TestHarness;
pub use instrumentor::MockGraphInstrumentor;

use std::sync::Once;

static INIT: Once = Once::new();

/// Route `tracing` output through the test harness' captured writer.
///
/// Filtered by `RUST_LOG`; only the first call installs a subscriber.
pub fn init_test_logging() {
    INIT.call_once(|| {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_target(true),
            )
            .with(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}
