use async_trait::async_trait;
use serde_json::Value;
use stepcore::{Action, ActionContext, ActionError, ActionOutput, StepConfig};

/// Logs its message and inputs
pub struct DebugLog;

#[async_trait]
impl Action for DebugLog {
    fn action_type(&self) -> &str {
        "debug.log"
    }

    async fn run(&self, config: &StepConfig, ctx: ActionContext) -> Result<ActionOutput, ActionError> {
        let message = config
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("(no message)");

        let redacted = stepcore::sanitize(message);
        tracing::info!(
            execution_id = %ctx.execution_id,
            step_id = %ctx.step_id,
            "DEBUG: {}",
            redacted
        );
        ctx.events.info(format!("DEBUG: {}", redacted));

        let mut keys: Vec<&String> = ctx.inputs.keys().collect();
        keys.sort();
        for key in &keys {
            ctx.events.info(format!("  {}: {}", key, ctx.inputs[*key]));
        }

        Ok(ActionOutput::new()
            .with_output("message", message)
            .with_output("inputs", keys.iter().map(|k| Value::from(k.as_str())).collect::<Vec<_>>()))
    }

    fn validate_config(&self, config: &StepConfig) -> Result<(), ActionError> {
        match config.get("message") {
            None | Some(Value::String(_)) => Ok(()),
            Some(_) => Err(ActionError::InvalidConfig {
                field: "message".to_string(),
                reason: "expected a string".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::context;
    use serde_json::json;

    #[tokio::test]
    async fn echoes_message_and_input_names() {
        let mut config = StepConfig::new();
        config.insert("message".into(), json!("deploy finished"));
        let mut ctx = context("log");
        ctx.inputs.insert("build".into(), json!({"ok": true}));

        let out = DebugLog.run(&config, ctx).await.unwrap();
        assert_eq!(out.value, json!({"message": "deploy finished", "inputs": ["build"]}));
    }

    #[test]
    fn rejects_non_string_message() {
        let mut config = StepConfig::new();
        config.insert("message".into(), json!(7));
        assert!(DebugLog.validate_config(&config).is_err());
        assert!(DebugLog.validate_config(&StepConfig::new()).is_ok());
    }
}
