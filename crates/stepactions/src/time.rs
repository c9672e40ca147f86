use async_trait::async_trait;
use serde_json::Value;
use stepcore::{Action, ActionContext, ActionError, ActionOutput, StepConfig};
use tokio::time::{sleep, Duration};

const DEFAULT_DELAY_MS: u64 = 1000;

/// Delay execution for a specified duration
pub struct Delay;

fn delay_ms(config: &StepConfig) -> Result<u64, ActionError> {
    match config.get("delay_ms") {
        None => Ok(DEFAULT_DELAY_MS),
        Some(v) => v.as_u64().ok_or_else(|| ActionError::InvalidConfig {
            field: "delay_ms".to_string(),
            reason: "expected a non-negative integer".to_string(),
        }),
    }
}

#[async_trait]
impl Action for Delay {
    fn action_type(&self) -> &str {
        "time.delay"
    }

    async fn run(&self, config: &StepConfig, ctx: ActionContext) -> Result<ActionOutput, ActionError> {
        let delay_ms = delay_ms(config)?;
        ctx.events.info(format!("Delaying for {}ms", delay_ms));

        tokio::select! {
            _ = ctx.cancellation.cancelled() => return Err(ActionError::Cancelled),
            _ = sleep(Duration::from_millis(delay_ms)) => {}
        }

        // Pass through any inputs
        let inputs = ctx
            .inputs
            .into_iter()
            .collect::<serde_json::Map<String, Value>>();
        Ok(ActionOutput::json(Value::Object(inputs)).with_metadata("delay_ms", delay_ms))
    }

    fn validate_config(&self, config: &StepConfig) -> Result<(), ActionError> {
        delay_ms(config).map(|_| ())
    }
}
