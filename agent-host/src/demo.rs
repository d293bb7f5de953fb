//! DemoAgent - a counter agent that exercises every framework feature
//!
//! - state `{ "count": n }`, shared by every connection
//! - callables: `increment`, `get_count`, `count_to` (streaming), `fail`,
//!   `schedule_tick`, `inbox`
//! - scheduled callback: `tick`
//! - MCP tools: `add`, `increment`, `schedule_tick`
//! - inbound email is stored in its own `inbox` table

use crate::agent::{
    AgentBehavior, AgentClass, AgentContext, AgentError, MethodRegistry, StreamingResponse,
};
use crate::connection::{Connection, ConnectionStrategy};
use crate::mcp::{McpError, McpServer, McpTool, McpTransport, ProtocolServer};
use crate::scheduler::Schedule;
use async_trait::async_trait;
use serde_json::{json, Value};
use shared_types::jsonrpc::JsonRpcNotification;
use shared_types::InboundEmail;
use std::sync::Arc;

const MAX_COUNT_TO: i64 = 1000;

pub struct DemoAgent {
    step: i64,
}

impl DemoAgent {
    pub fn new(step: i64) -> Self {
        Self { step }
    }

    pub fn methods() -> MethodRegistry {
        MethodRegistry::new()
            .callable("increment", "Add `by` (default: the configured step) to the count")
            .callable("get_count", "Current count")
            .streaming("count_to", "Stream 1..=n, then the total")
            .callable("fail", "Always fails")
            .callable("schedule_tick", "Schedule a tick after `delay` seconds")
            .callable("inbox", "Emails received so far")
            .method("tick")
    }

    pub fn class(step: i64, strategy: ConnectionStrategy) -> AgentClass {
        AgentClass::new("demo", Self::methods(), strategy, move || {
            Box::new(DemoAgent::new(step))
        })
    }
}

fn arg_i64(args: &[Value], index: usize) -> Option<i64> {
    args.get(index).and_then(Value::as_i64)
}

async fn current_count(ctx: &mut AgentContext<'_>) -> Result<i64, AgentError> {
    Ok(ctx
        .state()
        .await?
        .and_then(|state| state.get("count").and_then(Value::as_i64))
        .unwrap_or(0))
}

async fn increment(ctx: &mut AgentContext<'_>, by: i64) -> Result<i64, AgentError> {
    let mut state = ctx.state().await?.unwrap_or_else(|| json!({}));
    let next = state.get("count").and_then(Value::as_i64).unwrap_or(0) + by;
    match state.as_object_mut() {
        Some(fields) => {
            fields.insert("count".to_string(), json!(next));
        }
        None => state = json!({ "count": next }),
    }
    ctx.set_state(state).await?;
    Ok(next)
}

#[async_trait]
impl AgentBehavior for DemoAgent {
    fn initial_state(&self) -> Option<Value> {
        Some(json!({ "count": 0 }))
    }

    fn mcp_server(&self) -> Option<Box<dyn ProtocolServer>> {
        let server = McpServer::new("demo-agent", env!("CARGO_PKG_VERSION"))
            .tool(Arc::new(AddTool))
            .tool(Arc::new(IncrementTool { step: self.step }))
            .tool(Arc::new(ScheduleTickTool));
        Some(Box::new(server))
    }

    async fn on_start(&mut self, ctx: &mut AgentContext<'_>) -> Result<(), AgentError> {
        ctx.execute(
            "CREATE TABLE IF NOT EXISTS inbox (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sender TEXT NOT NULL,
                subject TEXT,
                body TEXT NOT NULL
            )",
            &[],
        )
        .await?;
        Ok(())
    }

    async fn on_message(
        &mut self,
        _ctx: &mut AgentContext<'_>,
        conn: &Connection,
        message: String,
    ) -> Result<(), AgentError> {
        conn.send_json(&json!({ "type": "echo", "message": message }))?;
        Ok(())
    }

    fn on_state_update(&mut self, state: &Value, source: Option<&str>) {
        tracing::debug!(source = source.unwrap_or("server"), state = %state, "Demo state updated");
    }

    async fn on_email(
        &mut self,
        ctx: &mut AgentContext<'_>,
        email: InboundEmail,
    ) -> Result<(), AgentError> {
        ctx.execute(
            "INSERT INTO inbox (sender, subject, body) VALUES (?, ?, ?)",
            &[json!(email.from), json!(email.subject), json!(email.body)],
        )
        .await?;
        Ok(())
    }

    async fn invoke(
        &mut self,
        ctx: &mut AgentContext<'_>,
        method: &str,
        args: Vec<Value>,
        stream: Option<&mut StreamingResponse>,
    ) -> Result<Value, AgentError> {
        match method {
            "increment" => {
                let by = arg_i64(&args, 0).unwrap_or(self.step);
                Ok(json!(increment(ctx, by).await?))
            }
            "get_count" => Ok(json!(current_count(ctx).await?)),
            "count_to" => {
                let n = arg_i64(&args, 0)
                    .filter(|n| (0..=MAX_COUNT_TO).contains(n))
                    .ok_or_else(|| {
                        AgentError::InvalidArguments(format!(
                            "count_to expects an integer between 0 and {MAX_COUNT_TO}"
                        ))
                    })?;
                let stream = stream
                    .ok_or_else(|| AgentError::Failed("count_to must be streamed".into()))?;
                for i in 1..=n {
                    stream.send(json!(i))?;
                }
                Ok(json!({ "total": n }))
            }
            "fail" => Err(AgentError::Failed("fail was called".into())),
            "schedule_tick" => {
                let delay = arg_i64(&args, 0).unwrap_or(1);
                let payload = args.get(1).cloned().unwrap_or(Value::Null);
                let task = ctx.schedule(Schedule::Delay(delay), "tick", payload).await?;
                Ok(json!({ "id": task.id, "time": task.time }))
            }
            "inbox" => Ok(Value::Array(
                ctx.query("SELECT sender, subject, body FROM inbox ORDER BY id", &[])
                    .await?,
            )),
            "tick" => {
                let count = increment(ctx, self.step).await?;
                tracing::info!(agent = %ctx.name(), count, payload = ?args.first(), "Tick");
                Ok(Value::Null)
            }
            other => Err(AgentError::NotCallable(other.to_string())),
        }
    }
}

// ============================================================================
// MCP tools
// ============================================================================

struct AddTool;

#[async_trait]
impl McpTool for AddTool {
    fn name(&self) -> &str {
        "add"
    }

    fn description(&self) -> &str {
        "Add two numbers"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "a": {"type": "number"},
                "b": {"type": "number"}
            },
            "required": ["a", "b"]
        })
    }

    async fn call(
        &self,
        _ctx: &mut AgentContext<'_>,
        arguments: Value,
        _transport: &mut dyn McpTransport,
    ) -> Result<Value, McpError> {
        let a = arguments.get("a").and_then(Value::as_f64);
        let b = arguments.get("b").and_then(Value::as_f64);
        match (a, b) {
            (Some(a), Some(b)) => Ok(json!(a + b)),
            _ => Err(McpError::Tool("a and b must be numbers".into())),
        }
    }
}

struct IncrementTool {
    step: i64,
}

#[async_trait]
impl McpTool for IncrementTool {
    fn name(&self) -> &str {
        "increment"
    }

    fn description(&self) -> &str {
        "Increment the shared counter"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"by": {"type": "integer"}}
        })
    }

    async fn call(
        &self,
        ctx: &mut AgentContext<'_>,
        arguments: Value,
        transport: &mut dyn McpTransport,
    ) -> Result<Value, McpError> {
        let by = arguments
            .get("by")
            .and_then(Value::as_i64)
            .unwrap_or(self.step);
        let count = increment(ctx, by).await?;
        transport.send(
            JsonRpcNotification::new(
                "notifications/message",
                Some(json!({"level": "info", "data": format!("count is now {count}")})),
            )
            .into(),
        );
        Ok(json!({ "count": count }))
    }
}

struct ScheduleTickTool;

#[async_trait]
impl McpTool for ScheduleTickTool {
    fn name(&self) -> &str {
        "schedule_tick"
    }

    fn description(&self) -> &str {
        "Schedule a counter tick after a delay"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"delay": {"type": "integer", "minimum": 0}}
        })
    }

    async fn call(
        &self,
        ctx: &mut AgentContext<'_>,
        arguments: Value,
        _transport: &mut dyn McpTransport,
    ) -> Result<Value, McpError> {
        let delay = arguments.get("delay").and_then(Value::as_i64).unwrap_or(1);
        let task = ctx
            .schedule(Schedule::Delay(delay), "tick", arguments)
            .await?;
        Ok(json!({ "id": task.id, "time": task.time }))
    }
}
