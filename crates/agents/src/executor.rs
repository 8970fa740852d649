//! Dispatch tool calls against a [`ToolRegistry`].
//!
//! Every call yields exactly one [`ToolResult`]. Failures of any kind become
//! an `{"error": "..."}` payload the model can read; nothing escapes.

use std::{panic::AssertUnwindSafe, sync::Arc};

use {
    futures::FutureExt,
    serde_json::{Map, Value},
    tracing::{info, warn},
};

use crate::{
    model::{ToolCall, ToolResult},
    tool_registry::{ToolError, ToolRegistry},
};

/// Name reported for results of calls that carried no function name.
pub const UNKNOWN_FUNCTION: &str = "unknown_function";

/// Counter of executed tool calls, labelled by `tool` and `outcome`.
#[cfg(feature = "metrics")]
pub const TOOL_CALLS_TOTAL: &str = "toolstream_tool_calls_total";

/// Executes tool calls and shapes their outcomes into [`ToolResult`]s.
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Execute `calls`, returning one result per call in input order.
    pub async fn execute(&self, calls: &[ToolCall]) -> Vec<ToolResult> {
        if calls.is_empty() {
            return Vec::new();
        }
        futures::future::join_all(calls.iter().map(|call| self.execute_one(call))).await
    }

    async fn execute_one(&self, call: &ToolCall) -> ToolResult {
        let name = call.name.trim();
        let result_name = if name.is_empty() {
            UNKNOWN_FUNCTION
        } else {
            name
        };
        let (content, outcome) = match self.invoke(name, &call.arguments).await {
            Ok(value) => {
                info!(tool = %result_name, id = %call.id, "tool execution succeeded");
                (encode_success(&value), "success")
            },
            Err(message) => {
                warn!(tool = %result_name, id = %call.id, error = %message, "tool execution failed");
                (error_content(&message), "error")
            },
        };

        #[cfg(feature = "metrics")]
        metrics::counter!(
            TOOL_CALLS_TOTAL,
            "tool" => result_name.to_string(),
            "outcome" => outcome
        )
        .increment(1);
        #[cfg(not(feature = "metrics"))]
        let _ = outcome;

        ToolResult {
            tool_call_id: call.id.clone(),
            name: result_name.to_string(),
            content,
        }
    }

    async fn invoke(&self, name: &str, arguments: &Value) -> Result<Value, String> {
        let args = parse_arguments(arguments)?;
        if name.is_empty() {
            return Err("Function name missing in tool call.".into());
        }
        let Some(tool) = self.registry.get(name) else {
            return Err(format!("Function '{name}' not available."));
        };

        let outcome = AssertUnwindSafe(tool.execute(Value::Object(args)))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(ToolError::InvalidArguments(detail))) => {
                Err(format!("Argument mismatch calling '{name}': {detail}"))
            },
            Ok(Err(ToolError::Failed(e))) => Err(format!("Error executing '{name}': {e:#}")),
            Err(panic) => Err(format!(
                "Error executing '{name}': {}",
                panic_message(panic.as_ref())
            )),
        }
    }
}

/// Normalize call arguments to a JSON object.
///
/// Strings are decoded as JSON (an empty string counts as `{}`); objects are
/// used as-is; anything else is rejected.
pub fn parse_arguments(arguments: &Value) -> Result<Map<String, Value>, String> {
    match arguments {
        Value::Object(map) => Ok(map.clone()),
        Value::String(raw) if raw.trim().is_empty() => Ok(Map::new()),
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(format!(
                "Malformed arguments: expected a JSON object, got {}",
                value_kind(&other)
            )),
            Err(e) => Err(format!("Invalid JSON arguments: {e}")),
        },
        Value::Null => Ok(Map::new()),
        other => Err(format!("Unexpected argument format: {}", value_kind(other))),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn encode_success(value: &Value) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|e| error_content(&format!("Failed to encode tool result: {e}")))
}

fn error_content(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "tool panicked".into()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use {
        super::*,
        crate::{fallback::FormatFallbackParser, tool_registry::AgentTool},
        async_trait::async_trait,
    };

    /// Records invocations; fails or panics on request.
    struct DeliveryDate {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AgentTool for DeliveryDate {
        fn name(&self) -> &str {
            "get_delivery_date"
        }

        fn description(&self) -> &str {
            "Estimated delivery date for an order"
        }

        fn parameters_schema(&self) -> Value {
            serde_json::json!({
                "type": "object",
                "properties": {"order_id": {"type": "string"}},
                "required": ["order_id"],
            })
        }

        async fn execute(&self, params: Value) -> Result<Value, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let Some(order_id) = params.get("order_id").and_then(Value::as_str) else {
                return Err(ToolError::InvalidArguments(
                    "missing required parameter `order_id`".into(),
                ));
            };
            match order_id {
                "boom" => Err(ToolError::Failed(anyhow::anyhow!("database offline"))),
                "panic" => panic!("tool blew up"),
                _ => Ok(serde_json::json!({
                    "order_id": order_id,
                    "estimated_delivery_date": "2026-10-22",
                })),
            }
        }
    }

    fn executor() -> (ToolExecutor, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry
            .register(Box::new(DeliveryDate {
                calls: Arc::clone(&calls),
            }))
            .unwrap();
        (ToolExecutor::new(Arc::new(registry)), calls)
    }

    fn call(id: &str, name: &str, arguments: Value) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    fn error_of(result: &ToolResult) -> String {
        let v: Value = serde_json::from_str(&result.content).unwrap();
        v["error"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn empty_input_is_noop() {
        let (exec, calls) = executor();
        assert!(exec.execute(&[]).await.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn success_is_encoded_verbatim() {
        let (exec, _) = executor();
        let results = exec
            .execute(&[call(
                "call_1",
                "get_delivery_date",
                Value::String(r#"{"order_id": "ORD-JAN08"}"#.into()),
            )])
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].tool_call_id, "call_1");
        assert_eq!(results[0].name, "get_delivery_date");
        let v: Value = serde_json::from_str(&results[0].content).unwrap();
        assert_eq!(v["order_id"], "ORD-JAN08");
        assert!(!results[0].is_error());
    }

    #[tokio::test]
    async fn malformed_json_never_invokes_tool() {
        let (exec, calls) = executor();
        let results = exec
            .execute(&[call("c", "get_delivery_date", Value::String("{bad json".into()))])
            .await;
        assert_eq!(results.len(), 1);
        assert!(error_of(&results[0]).starts_with("Invalid JSON arguments"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_object_json_is_rejected() {
        let (exec, calls) = executor();
        let results = exec
            .execute(&[
                call("a", "get_delivery_date", Value::String("[1, 2]".into())),
                call("b", "get_delivery_date", serde_json::json!(42)),
            ])
            .await;
        assert_eq!(
            error_of(&results[0]),
            "Malformed arguments: expected a JSON object, got array"
        );
        assert_eq!(error_of(&results[1]), "Unexpected argument format: number");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_and_unknown_names() {
        let (exec, _) = executor();
        let results = exec
            .execute(&[
                call("a", "", serde_json::json!({})),
                call("b", "launch_rocket", serde_json::json!({})),
            ])
            .await;
        assert_eq!(results[0].name, UNKNOWN_FUNCTION);
        assert_eq!(error_of(&results[0]), "Function name missing in tool call.");
        assert_eq!(results[1].name, "launch_rocket");
        assert_eq!(error_of(&results[1]), "Function 'launch_rocket' not available.");
    }

    #[tokio::test]
    async fn mismatch_failure_and_panic_are_contained() {
        let (exec, calls) = executor();
        let results = exec
            .execute(&[
                call("a", "get_delivery_date", serde_json::json!({"id": "x"})),
                call("b", "get_delivery_date", serde_json::json!({"order_id": "boom"})),
                call("c", "get_delivery_date", serde_json::json!({"order_id": "panic"})),
                call("d", "get_delivery_date", serde_json::json!({"order_id": "ORD-X"})),
            ])
            .await;
        assert_eq!(results.len(), 4);
        assert!(error_of(&results[0]).starts_with("Argument mismatch calling 'get_delivery_date'"));
        assert_eq!(
            error_of(&results[1]),
            "Error executing 'get_delivery_date': database offline"
        );
        assert_eq!(
            error_of(&results[2]),
            "Error executing 'get_delivery_date': tool blew up"
        );
        assert!(!results[3].is_error());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn results_preserve_order_and_count() {
        let (exec, _) = executor();
        let input: Vec<ToolCall> = (0..8)
            .map(|i| {
                let args = if i % 3 == 0 {
                    Value::String("nope".into())
                } else {
                    serde_json::json!({"order_id": format!("ORD-{i}")})
                };
                call(&format!("call_{i}"), "get_delivery_date", args)
            })
            .collect();
        let results = exec.execute(&input).await;
        assert_eq!(results.len(), input.len());
        for (call, result) in input.iter().zip(&results) {
            assert_eq!(call.id, result.tool_call_id);
        }
    }

    #[tokio::test]
    async fn fallback_parsed_calls_get_distinct_ids() {
        let (exec, _) = executor();
        let text = "[TOOL_CALLS] [{\"name\": \"get_delivery_date\", \"arguments\": {\"order_id\": \"ORD-JAN08\"}}, {\"name\": \"get_delivery_date\", \"arguments\": {\"order_id\": \"ORD-BOB07\"}}]";
        let calls = FormatFallbackParser::new().extract(text).unwrap();
        let results = exec.execute(&calls).await;
        assert_eq!(results.len(), 2);
        assert_ne!(results[0].tool_call_id, results[1].tool_call_id);
        assert_eq!(results[0].tool_call_id, calls[0].id);
        assert!(results.iter().all(|r| !r.is_error()));
    }

    #[test]
    fn parse_arguments_cases() {
        assert!(parse_arguments(&Value::String(String::new())).unwrap().is_empty());
        assert!(parse_arguments(&Value::Null).unwrap().is_empty());
        let map = parse_arguments(&serde_json::json!({"k": 1})).unwrap();
        assert_eq!(map["k"], 1);
        assert!(parse_arguments(&Value::String("\"str\"".into())).is_err());
    }
}
