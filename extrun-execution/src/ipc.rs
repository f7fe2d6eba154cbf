//! Protocol types shared with the worker process

// Re-export everything from extrun-ipc for convenience
pub use extrun_ipc::*;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_catching_step_meta_carries_error() {
        let error = TransportError::new("upstream failed").with_code("EUPSTREAM");
        let meta = StepMeta::new("@foo/bar", "@foo/bar/catch.js", InvocationMeta::new("shop_1", "d"))
            .catching(Some(error.clone()));

        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["isErrorCatching"], json!(true));
        assert_eq!(value["catchableError"]["code"], json!("EUPSTREAM"));

        let back: StepMeta = serde_json::from_value(value).unwrap();
        assert_eq!(back.catchable_error, Some(error));
    }
}
