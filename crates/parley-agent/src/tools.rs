//! Tool execution and result normalisation

use parley_ai::{Interaction, ProviderExecutor, ToolError, ToolFilter, ToolRequest, ToolReturn};
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Execute one tool call and turn the outcome into a tool result interaction.
///
/// Failures never escape: they become diagnostic results the model can read.
pub async fn execute(
    executor: &dyn ProviderExecutor,
    call: &Interaction,
    filter: &ToolFilter,
    cancel: CancellationToken,
) -> Interaction {
    match run_tool(executor, call, filter, cancel).await {
        Ok(ret) => normalize_result(call, ret),
        Err(e) => {
            tracing::warn!(
                tool = call.tool_name().unwrap_or_default(),
                "Tool call failed: {}",
                e
            );
            diagnostic_result(call, &e.to_string(), vec![])
        }
    }
}

async fn run_tool(
    executor: &dyn ProviderExecutor,
    call: &Interaction,
    filter: &ToolFilter,
    cancel: CancellationToken,
) -> Result<ToolReturn, ToolError> {
    let request = ToolRequest::from_call(call)?;
    if !filter.allows(&request.name) {
        return Err(ToolError::NotPermitted(request.name));
    }
    executor.exec_tool(&request, cancel).await
}

/// Convert a tool return into the result interaction recorded in history
pub fn normalize_result(call: &Interaction, ret: ToolReturn) -> Interaction {
    let result = match (ret.success, ret.result) {
        (true, Some(value)) => result_for(call, value, false),
        (true, None) => diagnostic_result(call, &ToolError::NoResult.to_string(), ret.messages),
        (false, _) => {
            let error = ret
                .messages
                .first()
                .cloned()
                .unwrap_or_else(|| "tool reported failure".to_string());
            diagnostic_result(call, &error, ret.messages)
        }
    };
    match ret.metrics {
        Some(metrics) => result.with_metrics(metrics),
        None => result,
    }
}

/// A `success: false` result describing why a call produced nothing usable
pub fn diagnostic_result(call: &Interaction, error: &str, messages: Vec<String>) -> Interaction {
    result_for(
        call,
        json!({
            "success": false,
            "error": error,
            "messages": messages,
        }),
        true,
    )
}

fn result_for(call: &Interaction, value: serde_json::Value, is_error: bool) -> Interaction {
    Interaction::tool_result(
        call.tool_call_id().unwrap_or_default(),
        call.tool_name().unwrap_or_default(),
        value,
        is_error,
    )
    .with_turn(call.turn_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parley_ai::{Metrics, Payload, ProviderReply, Request, TurnId};

    struct Tools;

    #[async_trait]
    impl ProviderExecutor for Tools {
        async fn exec(
            &self,
            _request: &Request,
            _cancel: CancellationToken,
        ) -> parley_ai::Result<ProviderReply> {
            Ok(ProviderReply::new(vec![]))
        }

        async fn exec_tool(
            &self,
            request: &ToolRequest,
            _cancel: CancellationToken,
        ) -> Result<ToolReturn, ToolError> {
            match request.name.as_str() {
                "echo" => Ok(ToolReturn::ok(request.arguments.clone())),
                "broken" => Ok(ToolReturn::failed("disk on fire")),
                other => Err(ToolError::NotFound(other.to_string())),
            }
        }
    }

    fn call_for(name: &str, args: &str) -> Interaction {
        Interaction::tool_call("c1", name, args).with_turn(TurnId::from("t1"))
    }

    #[tokio::test]
    async fn test_success_keeps_call_identity() {
        let call = call_for("echo", r#"{"a":1}"#);
        let result = execute(&Tools, &call, &ToolFilter::All, CancellationToken::new()).await;
        assert!(!result.is_error());
        assert_eq!(result.tool_result_id(), Some("c1"));
        assert_eq!(result.turn_id, TurnId::from("t1"));
    }

    #[tokio::test]
    async fn test_failures_become_diagnostics() {
        for (name, args) in [("broken", "{}"), ("missing", "{}"), ("echo", "{not json")] {
            let call = call_for(name, args);
            let result = execute(&Tools, &call, &ToolFilter::All, CancellationToken::new()).await;
            assert!(result.is_error(), "{} should fail", name);
            assert_eq!(result.tool_result_id(), Some("c1"));
        }
    }

    #[test]
    fn test_success_without_result_is_diagnostic() {
        let ret = ToolReturn {
            success: true,
            metrics: Some(Metrics::new(0, 1)),
            ..Default::default()
        };
        let result = normalize_result(&call_for("echo", "{}"), ret);
        assert!(result.is_error());
        assert_eq!(result.metrics, Some(Metrics::new(0, 1)));
    }

    #[tokio::test]
    async fn test_filter_blocks_tool() {
        let filter = ToolFilter::Only(vec!["other".into()]);
        let result = execute(&Tools, &call_for("echo", "{}"), &filter, CancellationToken::new()).await;
        match &result.payload {
            Payload::ToolResult { result, is_error, .. } => {
                assert!(*is_error);
                assert_eq!(result["success"], false);
                assert!(result["error"].as_str().unwrap().contains("not permitted"));
            }
            other => panic!("expected tool result, got {:?}", other),
        }
    }
}
