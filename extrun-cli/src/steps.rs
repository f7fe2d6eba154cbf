//! Steps compiled into the `extrun` binary

use serde_json::json;

use extrun_execution::{async_step, callback_step, StepRegistry};

/// Extension id the bundled steps register under
pub const EXAMPLES_EXTENSION: &str = "@extrun/examples";

/// Registry served by the worker process
pub fn registry() -> StepRegistry {
    let registry = StepRegistry::new();
    registry
        .register(
            EXAMPLES_EXTENSION,
            "echo.js",
            callback_step(|call| {
                call.context.log.debug("echoing input");
                call.done.ok(call.input);
            }),
        )
        .register(
            EXAMPLES_EXTENSION,
            "app-info.js",
            async_step(|call| async move {
                let app = call.context.app.get_info().await?;
                let device = call.context.device.get_info().await?;
                Ok(json!({ "app": app, "device": device, "input": call.input }))
            }),
        );
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundled_steps_registered() {
        let registry = registry();
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(EXAMPLES_EXTENSION, "echo.js"));
        assert!(registry.contains(EXAMPLES_EXTENSION, "./app-info.js"));
    }
}
