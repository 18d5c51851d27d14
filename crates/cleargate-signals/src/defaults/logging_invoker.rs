//! Target invoker used when no workflow runtime is attached.

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::InvokeError;
use crate::traits::{InvocationContext, TargetInvoker};

/// Logs each workflow invocation and returns `null`.
pub struct LoggingInvoker;

#[async_trait]
impl TargetInvoker for LoggingInvoker {
    async fn invoke(
        &self,
        workflow_id: &str,
        input: Value,
        ctx: InvocationContext,
    ) -> Result<Value, InvokeError> {
        tracing::info!(
            workflow_id,
            trigger = %ctx.trigger_name,
            activation_id = %ctx.activation_id,
            input = %input,
            "workflow invocation (no runtime attached)"
        );
        Ok(Value::Null)
    }
}
