use async_trait::async_trait;
use serde_json::{Map, Value};
use stepcore::{Action, ActionContext, ActionError, ActionOutput, StepConfig};

/// Merges predecessor outputs into one object.
///
/// Object outputs are merged key by key in step-id order; any other output
/// is placed under its step id. Keys from the `with` config object are
/// applied last, and `include_parameters: true` adds the execution
/// parameters under `parameters`.
pub struct Merge;

fn options(config: &StepConfig) -> Result<(Option<&Map<String, Value>>, bool), ActionError> {
    let with = match config.get("with") {
        None => None,
        Some(Value::Object(map)) => Some(map),
        Some(_) => {
            return Err(ActionError::InvalidConfig {
                field: "with".to_string(),
                reason: "expected an object".to_string(),
            })
        }
    };
    let include_parameters = match config.get("include_parameters") {
        None => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => {
            return Err(ActionError::InvalidConfig {
                field: "include_parameters".to_string(),
                reason: "expected a boolean".to_string(),
            })
        }
    };
    Ok((with, include_parameters))
}

#[async_trait]
impl Action for Merge {
    fn action_type(&self) -> &str {
        "transform.merge"
    }

    async fn run(&self, config: &StepConfig, ctx: ActionContext) -> Result<ActionOutput, ActionError> {
        let (with, include_parameters) = options(config)?;

        let mut sources: Vec<(&String, &Value)> = ctx.inputs.iter().collect();
        sources.sort_by(|a, b| a.0.cmp(b.0));

        let mut merged = Map::new();
        for (step_id, output) in sources {
            match output {
                Value::Object(fields) => {
                    for (key, value) in fields {
                        merged.insert(key.clone(), value.clone());
                    }
                }
                Value::Null => {}
                other => {
                    merged.insert(step_id.clone(), other.clone());
                }
            }
        }
        if let Some(with) = with {
            for (key, value) in with {
                merged.insert(key.clone(), value.clone());
            }
        }
        if include_parameters {
            merged.insert("parameters".to_string(), Value::Object(ctx.parameters.clone()));
        }

        Ok(ActionOutput::json(Value::Object(merged)).with_metadata("sources", ctx.inputs.len()))
    }

    fn validate_config(&self, config: &StepConfig) -> Result<(), ActionError> {
        options(config).map(|_| ())
    }
}
