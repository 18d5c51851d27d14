//! Default implementations for the pluggable kernel capabilities.
//!
//! These defaults allow the engine to start with zero external
//! configuration. Each can be replaced via the engine builder.

pub mod file_definitions;
pub mod in_memory_definitions;
pub mod in_memory_state;
pub mod in_memory_streams;
pub mod logging_invoker;
pub mod manual_clock;
pub mod metrics;
pub mod tracing_observability;

pub use file_definitions::FileDefinitionProvider;
pub use in_memory_definitions::InMemoryDefinitionProvider;
pub use in_memory_state::InMemoryStateStore;
pub use in_memory_streams::InMemoryStreams;
pub use logging_invoker::LoggingInvoker;
pub use manual_clock::ManualClock;
pub use metrics::{MetricsObserver, MetricsSnapshot};
pub use tracing_observability::TracingObservability;
