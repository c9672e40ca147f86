//! Standard action library
//!
//! Built-in actions for common step types

mod debug;
mod http;
mod time;
mod transform;

pub use debug::DebugLog;
pub use http::HttpWebhook;
pub use time::Delay;
pub use transform::Merge;

use std::sync::Arc;
use stepruntime::{ActionMetadata, ActionRegistry};

/// Register all standard actions with a registry
pub fn register_all(registry: &mut ActionRegistry) {
    registry.register_with(
        Arc::new(DebugLog),
        ActionMetadata::new("debug", "Log a message and the step's inputs"),
    );
    registry.register_with(
        Arc::new(Delay),
        ActionMetadata::new("time", "Wait for delay_ms milliseconds"),
    );
    registry.register_with(
        Arc::new(HttpWebhook::new()),
        ActionMetadata::new("http", "Send a JSON request to a webhook URL"),
    );
    registry.register_with(
        Arc::new(Merge),
        ActionMetadata::new("transform", "Merge predecessor outputs into one object"),
    );
}

#[cfg(test)]
pub(crate) mod testing {
    use stepcore::{ActionContext, EventBus, ExecutionId};

    pub fn context(step_id: &str) -> ActionContext {
        let bus = EventBus::new(16);
        let execution_id = ExecutionId::new_v4();
        ActionContext::new(execution_id, "test-workflow", step_id, bus.create_emitter(execution_id, step_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_every_builtin() {
        let mut registry = ActionRegistry::new();
        register_all(&mut registry);
        assert_eq!(
            registry.list_action_types(),
            vec!["debug.log", "http.webhook", "time.delay", "transform.merge"]
        );
        assert_eq!(registry.get_metadata("time.delay").unwrap().category, "time");
    }
}
