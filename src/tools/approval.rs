//! Approval gates: human confirmation before selected tools run.
//!
//! Gates are provided by the channel a task came from and travel on the
//! task runtime. Calls with no gate attached are rejected.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use super::policy::truncate_json;
use crate::config::ApprovalGateConfig;
use crate::provider::ToolCall;
use crate::task::Task;

/// A tool call waiting for confirmation.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub task_id: String,
    pub agent: String,
    pub tool: String,
    pub input: Value,
    /// Human-readable description of the call.
    pub summary: String,
}

#[async_trait]
pub trait ApprovalGate: Send + Sync {
    /// Block until the request is approved (`true`) or rejected (`false`).
    async fn request_approval(&self, req: ApprovalRequest) -> anyhow::Result<bool>;

    /// Remember that a tool no longer needs confirmation.
    fn auto_approve(&self, tool: &str);

    fn is_auto_approved(&self, tool: &str) -> bool;
}

/// One-line description of what a tool call will do.
pub fn summarize_tool_call(call: &ToolCall) -> String {
    let arg = |key: &str| match &call.input[key] {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    match call.name.as_str() {
        "exec" => format!("Run command: {}", arg("command")),
        "write" => format!("Write file: {}", arg("path")),
        "edit" => format!("Edit file: {}", arg("path")),
        "delete" => format!("Delete: {}", arg("path")),
        _ => format!("Execute {} with {}", call.name, truncate_json(&call.input, 100)),
    }
}

/// Ask the task's gate to approve a call.
///
/// Returns `Err(reason)` when the call must not run: no gate attached,
/// rejected, gate failure, or no answer within the configured timeout.
pub async fn request_tool_approval(
    cfg: &ApprovalGateConfig,
    gate: Option<&Arc<dyn ApprovalGate>>,
    task: &Task,
    call: &ToolCall,
) -> Result<(), String> {
    let Some(gate) = gate else {
        return Err("no approval gate available".to_string());
    };
    if gate.is_auto_approved(&call.name) {
        return Ok(());
    }

    let timeout = Duration::from_secs(if cfg.timeout_secs > 0 { cfg.timeout_secs } else { 120 });
    let req = ApprovalRequest {
        id: format!("gate-{}", uuid::Uuid::new_v4()),
        task_id: task.id.clone(),
        agent: task.agent.clone(),
        tool: call.name.clone(),
        input: call.input.clone(),
        summary: summarize_tool_call(call),
    };
    tracing::info!(task_id = %task.id, tool = %call.name, summary = %req.summary, "Requesting tool approval");

    match tokio::time::timeout(timeout, gate.request_approval(req)).await {
        Ok(Ok(true)) => Ok(()),
        Ok(Ok(false)) => Err("rejected by user".to_string()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("approval timed out after {}s", timeout.as_secs())),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Gate with a fixed answer and an optional delay.
    pub(crate) struct StaticGate {
        pub approve: bool,
        pub delay: Option<Duration>,
        pub auto: Mutex<HashSet<String>>,
        pub requests: Mutex<Vec<ApprovalRequest>>,
    }

    impl StaticGate {
        pub fn new(approve: bool) -> Self {
            Self {
                approve,
                delay: None,
                auto: Mutex::new(HashSet::new()),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ApprovalGate for StaticGate {
        async fn request_approval(&self, req: ApprovalRequest) -> anyhow::Result<bool> {
            self.requests.lock().unwrap().push(req);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.approve)
        }

        fn auto_approve(&self, tool: &str) {
            self.auto.lock().unwrap().insert(tool.to_string());
        }

        fn is_auto_approved(&self, tool: &str) -> bool {
            self.auto.lock().unwrap().contains(tool)
        }
    }

    fn call(name: &str, input: Value) -> ToolCall {
        ToolCall {
            id: "c".to_string(),
            name: name.to_string(),
            input,
        }
    }

    #[test]
    fn test_summaries() {
        assert_eq!(
            summarize_tool_call(&call("exec", json!({"command": "make test"}))),
            "Run command: make test"
        );
        assert_eq!(
            summarize_tool_call(&call("write", json!({"path": "a.txt", "content": "x"}))),
            "Write file: a.txt"
        );
        assert_eq!(
            summarize_tool_call(&call("web_fetch", json!({"url": "https://x"}))),
            r#"Execute web_fetch with {"url":"https://x"}"#
        );
    }

    #[tokio::test]
    async fn test_missing_gate_rejects() {
        let cfg = ApprovalGateConfig::default();
        let err = request_tool_approval(&cfg, None, &Task::new("p"), &call("exec", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err, "no approval gate available");
    }

    #[tokio::test]
    async fn test_gate_answers_and_auto_approval() {
        let cfg = ApprovalGateConfig::default();
        let task = Task::new("p");
        let exec = call("exec", json!({"command": "ls"}));

        let reject: Arc<dyn ApprovalGate> = Arc::new(StaticGate::new(false));
        assert_eq!(
            request_tool_approval(&cfg, Some(&reject), &task, &exec).await,
            Err("rejected by user".to_string())
        );
        reject.auto_approve("exec");
        assert!(request_tool_approval(&cfg, Some(&reject), &task, &exec).await.is_ok());

        let approve = Arc::new(StaticGate::new(true));
        let gate: Arc<dyn ApprovalGate> = approve.clone();
        assert!(request_tool_approval(&cfg, Some(&gate), &task, &exec).await.is_ok());
        assert_eq!(approve.requests.lock().unwrap()[0].summary, "Run command: ls");
    }

    #[tokio::test]
    async fn test_gate_timeout() {
        let cfg = ApprovalGateConfig {
            timeout_secs: 1,
            ..Default::default()
        };
        let mut slow = StaticGate::new(true);
        slow.delay = Some(Duration::from_secs(5));
        let gate: Arc<dyn ApprovalGate> = Arc::new(slow);
        let err = request_tool_approval(&cfg, Some(&gate), &Task::new("p"), &call("exec", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err, "approval timed out after 1s");
    }
}
