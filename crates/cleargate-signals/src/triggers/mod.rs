//! Trigger dispatch.
//!
//! A trigger turns cron ticks, signal and door messages, or stream items
//! into invocations of its targets. [`TriggerHost`] commits each activation
//! against the state store and hands the selected values to a per-trigger
//! [`TriggerDispatcher`]; cron and stream triggers are driven by
//! [`ActivationSource`]s under a [`TriggerRunner`].

pub mod cron_source;
pub mod dispatcher;
pub mod host;
pub mod output;
pub mod runner;
pub mod stream_source;

pub use cron_source::{normalize_cron_expression, parse_schedule, CronSource};
pub use dispatcher::{
    DispatchContext, InFlightRecorder, PendingItem, Reservation, TriggerDispatcher,
};
pub use host::{
    ActivationContext, ActivationOrigin, ActivationReport, Backpressure, ChannelKind,
    TriggerHost, TriggerSubscriber, TRIGGER_SCOPE,
};
pub use output::{select, Selection};
pub use runner::{ActivationSource, TriggerRunner};
pub use stream_source::StreamSource;
