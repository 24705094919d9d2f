//! Agentic tool-calling loop.
//!
//! Drives a multi-round conversation with a tool-capable provider: each round
//! the model either answers or requests tool calls, which are vetted (policy,
//! loop detection, trust tier, approval) and executed before the results are
//! fed back. Rounds and the calls within a round run strictly in sequence.

mod context;
mod loop_detector;

pub use context::{compress_messages, context_window_for_model, estimate_request_tokens};
pub use loop_detector::LoopDetector;

use std::collections::HashSet;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::task::AbortOnDropHandle;

use crate::budget::{BudgetAuthority, BudgetScope};
use crate::config::Config;
use crate::events::{Event, EventBroker, EventKind};
use crate::provider::{
    ContentBlock, Message, ProviderRequest, ProviderResult, Role, StopReason, ToolCall,
    ToolCapableProvider,
};
use crate::task::Task;
use crate::tools::approval::request_tool_approval;
use crate::tools::policy::{filter_tool_call, tool_trust_level, ToolDecision};
use crate::tools::{ToolContext, ToolRegistry};
use crate::trust::TrustLevel;

pub const BUDGET_STOP_MARKER: &str = "\n\n[stopped: global budget exceeded]";
pub const CONTEXT_STOP_MARKER: &str = "\n\n[stopped: context limit reached]";

const DEFAULT_MAX_ITERATIONS: usize = 10;
const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30;
const DEFAULT_KEEP_RECENT_PAIRS: usize = 3;
const DEFAULT_CONTEXT_THRESHOLD: f64 = 0.8;

/// Everything one loop execution reads from its surroundings.
pub struct LoopContext<'a> {
    pub config: &'a Config,
    pub tools: &'a ToolRegistry,
    /// Tools the agent may call; also the set offered to the model.
    pub allowed: &'a HashSet<String>,
    pub budget: Option<&'a dyn BudgetAuthority>,
    /// Falls back to the task's runtime broker when unset.
    pub events: Option<&'a EventBroker>,
    pub task: &'a Task,
    /// Trust tier set for the agent itself, if any.
    pub agent_level: Option<TrustLevel>,
    pub tool_ctx: ToolContext,
}

impl LoopContext<'_> {
    fn max_iterations(&self) -> usize {
        match self.config.tools.max_iterations {
            0 => DEFAULT_MAX_ITERATIONS,
            n => n,
        }
    }

    fn tool_timeout(&self) -> Duration {
        match self.config.tools.tool_timeout_secs {
            0 => Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECS),
            n => Duration::from_secs(n),
        }
    }

    fn publish(&self, kind: EventKind, data: serde_json::Value) {
        let broker = self.events.or(self.task.runtime.events.as_ref());
        if let Some(broker) = broker {
            let event = Event::new(kind, &self.task.id, &self.task.session_id, data);
            broker.publish_multi(&[self.task.id.as_str(), self.task.session_id.as_str()], event);
        }
    }
}

/// Usage summed over every round.
#[derive(Debug, Default)]
struct Usage {
    cost_usd: f64,
    tokens_in: u64,
    tokens_out: u64,
    provider_ms: u64,
}

impl Usage {
    fn add(&mut self, round: &ProviderResult) {
        self.cost_usd += round.cost_usd;
        self.tokens_in += round.tokens_in;
        self.tokens_out += round.tokens_out;
        self.provider_ms += round.provider_ms;
    }

    fn apply(&self, result: ProviderResult, started: Instant) -> ProviderResult {
        ProviderResult {
            cost_usd: self.cost_usd,
            tokens_in: self.tokens_in,
            tokens_out: self.tokens_out,
            provider_ms: self.provider_ms,
            duration_ms: started.elapsed().as_millis() as u64,
            ..result
        }
    }
}

/// Run the tool loop until the model answers, a stop condition fires, or
/// the iteration limit is reached.
pub async fn run_tool_loop(
    ctx: &LoopContext<'_>,
    provider: &dyn ToolCapableProvider,
    mut req: ProviderRequest,
) -> ProviderResult {
    let started = Instant::now();
    let max_iterations = ctx.max_iterations();
    let mut usage = Usage::default();
    let mut detector = LoopDetector::new();
    let mut messages = std::mem::take(&mut req.messages);
    let mut warned_soft_budget = false;

    req.tools = ctx.tools.definitions(ctx.allowed);
    tracing::debug!(
        task_id = %ctx.task.id,
        tools = req.tools.len(),
        max_iterations,
        "Starting tool loop"
    );

    for round in 0..max_iterations {
        req.messages = messages.clone();

        let result = match provider.execute_with_tools(&req).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(task_id = %ctx.task.id, round, error = %e, "Tool round failed");
                return usage.apply(ProviderResult::error(format!("{:#}", e)), started);
            }
        };
        usage.add(&result);

        if result.is_error
            || result.stop_reason != StopReason::ToolUse
            || result.tool_calls.is_empty()
        {
            return usage.apply(result, started);
        }

        for call in &result.tool_calls {
            ctx.publish(EventKind::ToolCall, json!({"id": call.id, "name": call.name}));
        }

        let mut assistant = Vec::with_capacity(result.tool_calls.len() + 1);
        if !result.output.is_empty() {
            assistant.push(ContentBlock::Text {
                text: result.output.clone(),
            });
        }
        let mut tool_results = Vec::with_capacity(result.tool_calls.len());

        for call in &result.tool_calls {
            let call_started = Instant::now();
            let (content, is_error) = handle_call(ctx, &mut detector, round, call).await;
            let duration_ms = call_started.elapsed().as_millis() as u64;
            tracing::debug!(
                task_id = %ctx.task.id,
                tool = %call.name,
                duration_ms,
                is_error,
                "Tool call finished"
            );
            ctx.publish(
                EventKind::ToolResult,
                json!({
                    "id": call.id,
                    "name": call.name,
                    "duration": duration_ms,
                    "isError": is_error,
                }),
            );

            assistant.push(ContentBlock::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
                input: call.input.clone(),
            });
            tool_results.push(ContentBlock::ToolResult {
                tool_use_id: call.id.clone(),
                content,
                is_error,
            });
        }

        messages.push(Message {
            role: Role::Assistant,
            content: assistant,
        });
        messages.push(Message {
            role: Role::User,
            content: tool_results,
        });

        let task = ctx.task;
        if task.budget > 0.0 && usage.cost_usd > task.budget && !warned_soft_budget {
            warned_soft_budget = true;
            tracing::warn!(
                task_id = %task.id,
                spent = usage.cost_usd,
                budget = task.budget,
                "Task budget exceeded, continuing"
            );
        }

        if let Some(budget) = ctx.budget {
            let check = budget.check(&task.agent, BudgetScope::Global, usage.cost_usd).await;
            if !check.allowed {
                tracing::warn!(task_id = %task.id, message = %check.message, "Global budget exceeded, stopping tool loop");
                let mut stopped = usage.apply(result, started);
                stopped.output.push_str(BUDGET_STOP_MARKER);
                return stopped;
            }
        }

        if !fit_context(ctx, &req, &mut messages) {
            let mut stopped = usage.apply(result, started);
            stopped.output.push_str(CONTEXT_STOP_MARKER);
            return stopped;
        }
    }

    tracing::warn!(task_id = %ctx.task.id, max_iterations, "Tool loop exhausted");
    usage.apply(
        ProviderResult::error(format!("max tool iterations ({}) reached", max_iterations)),
        started,
    )
}

/// Compress `messages` when the next request would exceed the context
/// threshold. Returns false when it still does not fit.
fn fit_context(ctx: &LoopContext<'_>, req: &ProviderRequest, messages: &mut [Message]) -> bool {
    let threshold = if ctx.config.tools.context_threshold > 0.0 {
        ctx.config.tools.context_threshold
    } else {
        DEFAULT_CONTEXT_THRESHOLD
    };
    let limit = (context_window_for_model(&req.model) as f64 * threshold) as u64;

    let estimate = |messages: &[Message]| {
        let candidate = ProviderRequest {
            messages: messages.to_vec(),
            ..req.clone()
        };
        estimate_request_tokens(&candidate)
    };

    let tokens = estimate(messages);
    if tokens <= limit {
        return true;
    }

    let keep = match ctx.config.tools.keep_recent_pairs {
        0 => DEFAULT_KEEP_RECENT_PAIRS,
        n => n,
    };
    let compressed = compress_messages(messages, keep);
    let after = estimate(messages);
    tracing::info!(
        task_id = %ctx.task.id,
        before = tokens,
        after,
        limit,
        compressed,
        "Compressed tool conversation"
    );
    if after > limit {
        tracing::warn!(task_id = %ctx.task.id, tokens = after, limit, "Context limit reached, stopping tool loop");
        return false;
    }
    true
}

/// Vet and run one call. Returns the tool result content and its error flag.
async fn handle_call(
    ctx: &LoopContext<'_>,
    detector: &mut LoopDetector,
    round: usize,
    call: &ToolCall,
) -> (String, bool) {
    let task = ctx.task;
    let name = call.name.as_str();

    if !ctx.allowed.contains(name) {
        tracing::warn!(task_id = %task.id, tool = name, agent = %task.agent, "Tool denied by policy");
        return (
            format!(
                "error: tool \"{}\" not allowed by policy for agent \"{}\"",
                name, task.agent
            ),
            true,
        );
    }

    if let Some(msg) = detector.check(name, &call.input) {
        tracing::warn!(task_id = %task.id, tool = name, "Tool call loop detected");
        return (msg, true);
    }
    if round > 2 {
        if let Some(msg) = detector.detect_pattern() {
            tracing::warn!(task_id = %task.id, tool = name, "Repeating tool pattern detected");
            return (msg, true);
        }
    }
    detector.record(name, &call.input);

    let tool = ctx.tools.get(name);
    let requires_auth = tool.as_ref().is_some_and(|t| t.requires_auth());
    let level = tool_trust_level(ctx.config, ctx.agent_level, name, requires_auth);
    if let ToolDecision::Withhold(msg) = filter_tool_call(level, &task.agent, call) {
        return (msg, false);
    }

    if ctx.config.approval_gates.needs_approval(name) {
        let gate = task.runtime.approval_gate.as_ref();
        if let Err(reason) = request_tool_approval(&ctx.config.approval_gates, gate, task, call).await {
            tracing::info!(task_id = %task.id, tool = name, reason = %reason, "Tool call rejected");
            return (format!("tool \"{}\" rejected: {}", name, reason), true);
        }
    }

    let Some(tool) = tool else {
        return (format!("error: tool \"{}\" not found", name), true);
    };

    let timeout = ctx.tool_timeout();
    let input = call.input.clone();
    let tool_ctx = ctx.tool_ctx.clone();
    // Aborted on drop: a cancelled or timed-out task leaves no tool running.
    let handle = AbortOnDropHandle::new(tokio::spawn(async move {
        tool.execute(input, &tool_ctx).await
    }));

    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(Ok(output))) => (truncate_output(output, ctx.config.tools.max_output_chars), false),
        Ok(Ok(Err(e))) => (format!("error: {:#}", e), true),
        Ok(Err(join)) if join.is_panic() => {
            tracing::error!(task_id = %task.id, tool = name, "Tool panicked");
            (format!("error: tool \"{}\" panicked", name), true)
        }
        Ok(Err(join)) => (format!("error: tool \"{}\" failed: {}", name, join), true),
        Err(_) => {
            tracing::warn!(task_id = %task.id, tool = name, timeout_secs = timeout.as_secs(), "Tool timed out");
            (
                format!("error: tool \"{}\" timed out after {}s", name, timeout.as_secs()),
                true,
            )
        }
    }
}

fn truncate_output(output: String, max_chars: usize) -> String {
    if max_chars == 0 {
        return output;
    }
    match output.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}\n... [output truncated]", &output[..idx]),
        None => output,
    }
}
