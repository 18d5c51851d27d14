//! Cron schedule activation source.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde_json::Value;

use super::host::{ActivationContext, ActivationOrigin, Backpressure, TriggerHost};
use super::runner::ActivationSource;
use crate::cancel::Cancellation;
use crate::errors::TriggerError;
use crate::types::DefinitionId;

/// Convert a 5-field cron expression to the seconds-first form the `cron`
/// crate expects. 6- and 7-field expressions pass through.
///
/// Standard cron: `min hour day month weekday`
/// Cron crate:    `sec min hour day month weekday [year]`
pub fn normalize_cron_expression(expr: &str) -> Result<String, String> {
    let fields = expr.split_whitespace().count();
    match fields {
        5 => Ok(format!("0 {}", expr.trim())),
        6 | 7 => Ok(expr.trim().to_string()),
        n => Err(format!("expected 5, 6 or 7 fields, found {n}")),
    }
}

/// Parse a cron expression in any accepted form.
pub fn parse_schedule(expr: &str) -> Result<Schedule, String> {
    let normalized = normalize_cron_expression(expr)?;
    Schedule::from_str(&normalized).map_err(|e| e.to_string())
}

/// Activates a trigger at each tick of its schedule.
///
/// Ticks are computed from the host's [`Clock`](crate::traits::Clock) and
/// never repeat: a clock that has not moved past the last tick resumes
/// from that tick. Ticks never queue up behind a full dispatcher: a
/// rejected activation is logged and the next tick is awaited.
pub struct CronSource {
    trigger_id: DefinitionId,
    expression: String,
    host: Arc<TriggerHost>,
}

impl CronSource {
    pub fn new(trigger_id: DefinitionId, expression: impl Into<String>, host: Arc<TriggerHost>) -> Self {
        Self {
            trigger_id,
            expression: expression.into(),
            host,
        }
    }
}

#[async_trait]
impl ActivationSource for CronSource {
    fn kind(&self) -> &str {
        "cron"
    }

    fn trigger_id(&self) -> DefinitionId {
        self.trigger_id
    }

    async fn run(&self, cancel: Cancellation) -> Result<(), TriggerError> {
        let schedule = parse_schedule(&self.expression).map_err(|message| TriggerError::Config {
            message: format!("invalid cron expression '{}': {message}", self.expression),
        })?;

        let clock = Arc::clone(self.host.clock());
        let mut last: Option<DateTime<Utc>> = None;
        loop {
            let now = clock.now();
            let from = match last {
                Some(tick) if tick > now => tick,
                _ => now,
            };
            let next = schedule
                .after(&from)
                .next()
                .ok_or_else(|| TriggerError::Runtime {
                    message: "cron schedule has no upcoming occurrences".into(),
                })?;
            let delay = (next - now)
                .to_std()
                .unwrap_or(std::time::Duration::from_millis(100));

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Ok(()),
            }
            last = Some(next);

            let ctx = ActivationContext {
                origin: ActivationOrigin::Cron { tick: next },
                input: Value::Null,
                correlation_id: None,
                caused_by: Vec::new(),
                backpressure: Backpressure::Reject,
            };
            match self.host.activate(self.trigger_id, ctx, &cancel).await {
                Ok(_) => {}
                Err(TriggerError::Cancelled) => return Ok(()),
                // Already reported by the host.
                Err(TriggerError::CapacityExceeded { .. }) => {}
                Err(e) => tracing::warn!(
                    trigger_id = %self.trigger_id,
                    tick = %next,
                    error = %e,
                    "cron activation failed"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::{InMemoryStateStore, InMemoryStreams, ManualClock, MetricsObserver};
    use crate::cancel::CancellationSource;
    use crate::testing::RecordingInvoker;
    use crate::traits::SystemClock;
    use crate::triggers::DispatchContext;
    use crate::types::{TriggerDefinition, TriggerSourceDefinition, TriggerTarget};
    use std::collections::HashMap;
    use std::sync::Weak;
    use std::time::Duration;

    #[test]
    fn test_normalize_5_field() {
        assert_eq!(
            normalize_cron_expression("*/5 * * * *").expect("valid"),
            "0 */5 * * * *"
        );
    }

    #[test]
    fn test_normalize_6_and_7_field_passthrough() {
        assert_eq!(
            normalize_cron_expression("0 */5 * * * *").expect("valid"),
            "0 */5 * * * *"
        );
        let seven = "0 */5 * * * * *";
        assert_eq!(normalize_cron_expression(seven).expect("valid"), seven);
    }

    #[test]
    fn test_invalid_schedules() {
        assert!(normalize_cron_expression("* *").is_err());
        assert!(parse_schedule("not a cron at all").is_err());
        assert!(parse_schedule("*/5 * * * *").is_ok());
    }

    #[tokio::test]
    async fn test_cron_activates_trigger() {
        tokio::time::pause();

        let def = TriggerDefinition::new(
            "every-second",
            TriggerSourceDefinition::Cron {
                expression: "* * * * * *".into(),
            },
        )
        .with_target(TriggerTarget::Workflow { id: "tick".into() });
        let invoker = Arc::new(RecordingInvoker::new());
        let host = Arc::new(TriggerHost::new(
            vec![def.clone()],
            16,
            Arc::new(InMemoryStateStore::new()),
            HashMap::new(),
            DispatchContext {
                invoker: invoker.clone(),
                registry: Weak::new(),
                streams: Arc::new(InMemoryStreams::new()),
                observability: Arc::new(MetricsObserver::new()),
                cancel: Cancellation::never(),
            },
            Arc::new(SystemClock),
            1,
        ));

        let source = CancellationSource::new();
        let cron = CronSource::new(def.id, "* * * * * *", host.clone());
        let token = source.token();
        let handle = tokio::spawn(async move { cron.run(token).await });

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        invoker.wait_for(1).await;
        assert_eq!(invoker.calls()[0].input, Value::Null);

        source.cancel();
        handle.await.expect("task completes").expect("no error");
        assert!(host.state(def.id).await.expect("state").fire_count >= 1);
    }

    #[tokio::test]
    async fn test_ticks_follow_injected_clock() {
        tokio::time::pause();

        let start = DateTime::parse_from_rfc3339("2026-01-01T00:00:00.500Z")
            .expect("valid timestamp")
            .with_timezone(&Utc);
        let clock = Arc::new(ManualClock::new(start));
        let def = TriggerDefinition::new(
            "minutely",
            TriggerSourceDefinition::Cron {
                expression: "* * * * *".into(),
            },
        )
        .with_target(TriggerTarget::Workflow { id: "tick".into() });
        let invoker = Arc::new(RecordingInvoker::new());
        let host = Arc::new(TriggerHost::new(
            vec![def.clone()],
            16,
            Arc::new(InMemoryStateStore::new()),
            HashMap::new(),
            DispatchContext {
                invoker: invoker.clone(),
                registry: Weak::new(),
                streams: Arc::new(InMemoryStreams::new()),
                observability: Arc::new(MetricsObserver::new()),
                cancel: Cancellation::never(),
            },
            clock.clone(),
            1,
        ));

        let source = CancellationSource::new();
        let cron = CronSource::new(def.id, "* * * * *", host.clone());
        let token = source.token();
        let handle = tokio::spawn(async move { cron.run(token).await });

        // The next minute boundary is 59.5s away on the injected clock.
        tokio::time::advance(Duration::from_millis(59_600)).await;
        tokio::task::yield_now().await;
        invoker.wait_for(1).await;

        source.cancel();
        handle.await.expect("task completes").expect("no error");
        let state = host.state(def.id).await.expect("state");
        assert_eq!(state.fire_count, 1);
        assert_eq!(state.last_fired_at, Some(start));
    }

    #[tokio::test]
    async fn test_cron_shutdown_before_tick() {
        tokio::time::pause();
        let host = Arc::new(TriggerHost::new(
            Vec::new(),
            16,
            Arc::new(InMemoryStateStore::new()),
            HashMap::new(),
            DispatchContext {
                invoker: Arc::new(RecordingInvoker::new()),
                registry: Weak::new(),
                streams: Arc::new(InMemoryStreams::new()),
                observability: Arc::new(MetricsObserver::new()),
                cancel: Cancellation::never(),
            },
            Arc::new(SystemClock),
            1,
        ));
        let source = CancellationSource::new();
        // Hourly, so it will not fire.
        let cron = CronSource::new(DefinitionId::new(), "0 0 * * * *", host);
        let token = source.token();
        let handle = tokio::spawn(async move { cron.run(token).await });
        tokio::task::yield_now().await;
        source.cancel();
        assert!(handle.await.expect("task completes").is_ok());
    }

    #[tokio::test]
    async fn test_invalid_expression_fails_to_start() {
        let host = Arc::new(TriggerHost::new(
            Vec::new(),
            16,
            Arc::new(InMemoryStateStore::new()),
            HashMap::new(),
            DispatchContext {
                invoker: Arc::new(RecordingInvoker::new()),
                registry: Weak::new(),
                streams: Arc::new(InMemoryStreams::new()),
                observability: Arc::new(MetricsObserver::new()),
                cancel: Cancellation::never(),
            },
            Arc::new(SystemClock),
            1,
        ));
        let cron = CronSource::new(DefinitionId::new(), "bogus", host);
        let err = cron.run(Cancellation::never()).await.unwrap_err();
        assert!(matches!(err, TriggerError::Config { .. }));
    }
}
