//! Tool Registry and Dispatch
//!
//! Tools are registered once, at startup, into an immutable `ToolRegistry`
//! that is shared by every session. Dispatch always terminates: whatever the
//! handler does (returns an error, panics, hangs, or is cancelled), the caller
//! gets back exactly one `ToolCallResult` for the call it issued.

use crate::envelope::{ToolCallRequest, ToolCallResult};
use crate::side_channel::{SideChannelEvent, SideChannelNotifier};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Default bound on a single tool execution.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(5);

/// Expected, recoverable tool failures. Each one is reported to the upstream AI
/// as a structured payload instead of failing the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolError {
    #[error("unknown tool '{tool}'")]
    UnknownTool { tool: String },
    #[error("invalid arguments: {message}")]
    InvalidArguments { message: String },
    #[error("provider failure: {message}")]
    ProviderFailure { message: String },
}

impl ToolError {
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::InvalidArguments {
            message: message.into(),
        }
    }

    pub fn provider_failure(message: impl Into<String>) -> Self {
        Self::ProviderFailure {
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("tool '{0}' registered more than once")]
    DuplicateTool(String),
}

/// A declared tool as advertised to the upstream in the handshake.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON-schema description of the arguments object.
    pub parameters: Value,
}

/// The successful result of a tool, plus any side-channel events to emit.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub result: Value,
    pub side_effects: Vec<SideChannelEvent>,
}

impl ToolOutput {
    pub fn new(result: Value) -> Self {
        Self {
            result,
            side_effects: Vec::new(),
        }
    }

    pub fn with_side_effect(mut self, event: SideChannelEvent) -> Self {
        self.side_effects.push(event);
        self
    }
}

/// Per-call execution context handed to a handler.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: Uuid,
    pub call_id: String,
    cancel: CancellationToken,
    notifier: Arc<dyn SideChannelNotifier>,
}

impl ToolContext {
    pub fn new(
        session_id: Uuid,
        call_id: impl Into<String>,
        cancel: CancellationToken,
        notifier: Arc<dyn SideChannelNotifier>,
    ) -> Self {
        Self {
            session_id,
            call_id: call_id.into(),
            cancel,
            notifier,
        }
    }

    /// Cancelled when the turn that issued the call is interrupted.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Pushes an event to the caller while the tool is still running.
    pub fn emit(&self, event: SideChannelEvent) {
        self.notifier.emit(self.session_id, event);
    }
}

/// Object-safe handler stored in the registry.
#[async_trait]
pub trait ToolHandler: Send + Sync + 'static {
    fn spec(&self) -> ToolSpec;

    async fn call(&self, ctx: ToolContext, args: Value) -> Result<ToolOutput, ToolError>;
}

/// A tool with typed arguments. Implementors get a `ToolHandler` for free,
/// including argument validation and the JSON schema for the handshake.
#[async_trait]
pub trait Tool: Send + Sync + 'static {
    type Args: DeserializeOwned + JsonSchema + Send;

    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    async fn run(&self, ctx: &ToolContext, args: Self::Args) -> Result<ToolOutput, ToolError>;
}

#[async_trait]
impl<T: Tool> ToolHandler for T {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: parameters_schema::<T::Args>(),
        }
    }

    async fn call(&self, ctx: ToolContext, args: Value) -> Result<ToolOutput, ToolError> {
        let args: T::Args = serde_json::from_value(args)
            .map_err(|e| ToolError::invalid_arguments(e.to_string()))?;
        self.run(&ctx, args).await
    }
}

/// Generates the parameters schema, minus the metadata keys the upstream rejects.
fn parameters_schema<A: JsonSchema>() -> Value {
    let schema = schemars::schema_for!(A);
    let mut value = serde_json::to_value(&schema)
        .unwrap_or_else(|_| serde_json::json!({ "type": "object" }));
    if let Some(map) = value.as_object_mut() {
        map.remove("$schema");
        map.remove("title");
        map.entry("properties")
            .or_insert_with(|| Value::Object(Default::default()));
    }
    value
}

/// Where a single tool call is in its lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationStatus {
    Created,
    Executing,
    Completed(ToolOutput),
    Failed(ToolError),
}

/// One tool call, from request to terminal outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Option<Value>,
    pub status: InvocationStatus,
}

impl ToolInvocation {
    fn new(request: &ToolCallRequest) -> Self {
        Self {
            call_id: request.call_id.clone(),
            tool_name: request.tool_name.clone(),
            arguments: None,
            status: InvocationStatus::Created,
        }
    }

    fn fail(mut self, err: ToolError) -> Self {
        self.status = InvocationStatus::Failed(err);
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            InvocationStatus::Completed(_) | InvocationStatus::Failed(_)
        )
    }

    /// Splits a terminal invocation into the upstream reply and the
    /// caller-bound side effects. Non-terminal invocations are reported as
    /// provider failures so that a result is still produced.
    pub fn into_result(self) -> (ToolCallResult, Vec<SideChannelEvent>) {
        let (outcome, side_effects) = match self.status {
            InvocationStatus::Completed(output) => (Ok(output.result), output.side_effects),
            InvocationStatus::Failed(err) => (Err(err), Vec::new()),
            InvocationStatus::Created | InvocationStatus::Executing => (
                Err(ToolError::provider_failure("invocation did not complete")),
                Vec::new(),
            ),
        };
        (
            ToolCallResult {
                call_id: self.call_id,
                outcome,
            },
            side_effects,
        )
    }
}

/// Immutable name → handler table, shared across sessions.
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
    specs: Vec<ToolSpec>,
    timeout: Duration,
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    /// Declared tools in registration order.
    pub fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Runs one tool call to a terminal outcome.
    ///
    /// Never fails: unknown tools, unparseable arguments, handler errors,
    /// panics, timeouts and cancellation all come back as a `Failed`
    /// invocation.
    pub async fn dispatch(&self, ctx: ToolContext, request: &ToolCallRequest) -> ToolInvocation {
        let mut invocation = ToolInvocation::new(request);

        let handler = match self.lookup(request) {
            Ok(handler) => handler,
            Err(err) => return invocation.fail(err),
        };

        let args = match parse_arguments(&request.arguments) {
            Ok(args) => args,
            Err(err) => return invocation.fail(err),
        };
        invocation.arguments = Some(args.clone());

        invocation.status = InvocationStatus::Executing;
        info!(tool = %request.tool_name, call_id = %request.call_id, "Executing tool");

        let cancel = ctx.cancellation().clone();
        let task = tokio::spawn(async move { handler.call(ctx, args).await });
        let abort = task.abort_handle();

        let outcome = tokio::select! {
            joined = tokio::time::timeout(self.timeout, task) => match joined {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) if join_err.is_panic() => {
                    Err(ToolError::provider_failure("tool handler panicked"))
                }
                Ok(Err(_)) => Err(ToolError::provider_failure("tool handler was aborted")),
                Err(_) => {
                    abort.abort();
                    Err(ToolError::provider_failure(format!(
                        "tool timed out after {} ms",
                        self.timeout.as_millis()
                    )))
                }
            },
            _ = cancel.cancelled() => {
                abort.abort();
                Err(ToolError::provider_failure("tool call cancelled by user interruption"))
            }
        };

        invocation.status = match outcome {
            Ok(output) => InvocationStatus::Completed(output),
            Err(err) => {
                warn!(tool = %request.tool_name, call_id = %request.call_id, error = %err, "Tool call failed");
                InvocationStatus::Failed(err)
            }
        };
        invocation
    }

    /// Answers a call whose arguments could not be decoded, without running
    /// it. An unknown tool is still reported as `UnknownTool`.
    pub fn reject(&self, request: &ToolCallRequest, err: ToolError) -> ToolInvocation {
        let invocation = ToolInvocation::new(request);
        match self.lookup(request) {
            Ok(_) => invocation.fail(err),
            Err(unknown) => invocation.fail(unknown),
        }
    }

    fn lookup(&self, request: &ToolCallRequest) -> Result<Arc<dyn ToolHandler>, ToolError> {
        self.handlers.get(&request.tool_name).cloned().ok_or_else(|| {
            warn!(tool = %request.tool_name, call_id = %request.call_id, "Unknown tool requested");
            ToolError::UnknownTool {
                tool: request.tool_name.clone(),
            }
        })
    }
}

fn parse_arguments(raw: &str) -> Result<Value, ToolError> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(raw).map_err(|e| ToolError::invalid_arguments(e.to_string()))
}

#[derive(Default)]
pub struct ToolRegistryBuilder {
    handlers: Vec<Arc<dyn ToolHandler>>,
    timeout: Option<Duration>,
}

impl ToolRegistryBuilder {
    pub fn register<H: ToolHandler>(mut self, handler: H) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<ToolRegistry, RegistryError> {
        let mut handlers = HashMap::with_capacity(self.handlers.len());
        let mut specs = Vec::with_capacity(self.handlers.len());
        for handler in self.handlers {
            let spec = handler.spec();
            if handlers.contains_key(&spec.name) {
                return Err(RegistryError::DuplicateTool(spec.name));
            }
            handlers.insert(spec.name.clone(), handler);
            specs.push(spec);
        }
        Ok(ToolRegistry {
            handlers,
            specs,
            timeout: self.timeout.unwrap_or(DEFAULT_TOOL_TIMEOUT),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::side_channel::{MockSideChannelNotifier, NullNotifier, SideChannelKind};
    use schemars::JsonSchema;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Deserialize, JsonSchema)]
    struct EchoArgs {
        /// Text to echo back.
        text: String,
    }

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        type Args = EchoArgs;

        fn name(&self) -> &'static str {
            "echo"
        }

        fn description(&self) -> &'static str {
            "Echo the text back"
        }

        async fn run(&self, _ctx: &ToolContext, args: EchoArgs) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::new(serde_json::json!({ "text": args.text }))
                .with_side_effect(SideChannelEvent::new(
                    SideChannelKind::Recommendation,
                    serde_json::json!([args.text]),
                )))
        }
    }

    #[derive(Deserialize, JsonSchema)]
    struct NoArgs {}

    struct Sleepy;

    #[async_trait]
    impl Tool for Sleepy {
        type Args = NoArgs;

        fn name(&self) -> &'static str {
            "sleepy"
        }

        fn description(&self) -> &'static str {
            "Never finishes in time"
        }

        async fn run(&self, _ctx: &ToolContext, _args: NoArgs) -> Result<ToolOutput, ToolError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ToolOutput::new(Value::Null))
        }
    }

    struct Panicky;

    #[async_trait]
    impl Tool for Panicky {
        type Args = NoArgs;

        fn name(&self) -> &'static str {
            "panicky"
        }

        fn description(&self) -> &'static str {
            "Always panics"
        }

        async fn run(&self, _ctx: &ToolContext, _args: NoArgs) -> Result<ToolOutput, ToolError> {
            panic!("boom");
        }
    }

    struct Announcer;

    #[async_trait]
    impl Tool for Announcer {
        type Args = NoArgs;

        fn name(&self) -> &'static str {
            "announcer"
        }

        fn description(&self) -> &'static str {
            "Emits mid-execution"
        }

        async fn run(&self, ctx: &ToolContext, _args: NoArgs) -> Result<ToolOutput, ToolError> {
            ctx.emit(SideChannelEvent::new(
                SideChannelKind::MediaSuggestion,
                serde_json::json!({ "video": "how-to" }),
            ));
            Ok(ToolOutput::new(serde_json::json!({ "ok": true })))
        }
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::builder()
            .register(Echo)
            .register(Sleepy)
            .register(Panicky)
            .register(Announcer)
            .timeout(Duration::from_millis(200))
            .build()
            .unwrap()
    }

    fn ctx(call_id: &str) -> ToolContext {
        ToolContext::new(
            Uuid::new_v4(),
            call_id,
            CancellationToken::new(),
            Arc::new(NullNotifier),
        )
    }

    fn request(call_id: &str, tool: &str, args: &str) -> ToolCallRequest {
        ToolCallRequest {
            call_id: call_id.to_string(),
            tool_name: tool.to_string(),
            arguments: args.to_string(),
        }
    }

    #[tokio::test]
    async fn test_dispatch_success_carries_side_effects() {
        let invocation = registry()
            .dispatch(ctx("c1"), &request("c1", "echo", r#"{"text":"drill"}"#))
            .await;
        assert!(invocation.is_terminal());
        let (result, side_effects) = invocation.into_result();
        assert_eq!(result.call_id, "c1");
        assert_eq!(result.outcome, Ok(serde_json::json!({ "text": "drill" })));
        assert_eq!(side_effects.len(), 1);
        assert_eq!(side_effects[0].kind, SideChannelKind::Recommendation);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_tool() {
        let invocation = registry()
            .dispatch(ctx("c2"), &request("c2", "teleport", "{}"))
            .await;
        let (result, _) = invocation.into_result();
        assert_eq!(
            result.outcome,
            Err(ToolError::UnknownTool {
                tool: "teleport".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_dispatch_unparseable_arguments() {
        let invocation = registry()
            .dispatch(ctx("c3"), &request("c3", "echo", "{not json"))
            .await;
        assert!(matches!(
            invocation.status,
            InvocationStatus::Failed(ToolError::InvalidArguments { .. })
        ));
    }

    #[tokio::test]
    async fn test_dispatch_unknown_tool_wins_over_bad_arguments() {
        let invocation = registry()
            .dispatch(ctx("c3b"), &request("c3b", "teleport", "{not json"))
            .await;
        assert_eq!(
            invocation.status,
            InvocationStatus::Failed(ToolError::UnknownTool {
                tool: "teleport".to_string()
            })
        );
        assert!(invocation.arguments.is_none());
    }

    #[test]
    fn test_reject_answers_without_running_the_handler() {
        let registry = registry();
        let invocation = registry.reject(
            &request("c10", "echo", r#"{"text":"drill"}"#),
            ToolError::invalid_arguments("arguments must be a JSON-encoded string"),
        );
        assert!(invocation.is_terminal());
        assert!(invocation.arguments.is_none());
        let (result, side_effects) = invocation.into_result();
        assert_eq!(result.call_id, "c10");
        assert!(matches!(result.outcome, Err(ToolError::InvalidArguments { .. })));
        assert!(side_effects.is_empty());

        let invocation = registry.reject(
            &request("c11", "teleport", "{not json"),
            ToolError::invalid_arguments("expected value"),
        );
        assert_eq!(
            invocation.status,
            InvocationStatus::Failed(ToolError::UnknownTool {
                tool: "teleport".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_dispatch_arguments_of_wrong_shape() {
        let invocation = registry()
            .dispatch(ctx("c4"), &request("c4", "echo", r#"{"query":"drill"}"#))
            .await;
        assert!(matches!(
            invocation.status,
            InvocationStatus::Failed(ToolError::InvalidArguments { .. })
        ));
    }

    #[tokio::test]
    async fn test_dispatch_empty_arguments_default_to_object() {
        let invocation = registry()
            .dispatch(ctx("c5"), &request("c5", "announcer", ""))
            .await;
        assert!(matches!(invocation.status, InvocationStatus::Completed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_times_out() {
        let started = tokio::time::Instant::now();
        let invocation = registry()
            .dispatch(ctx("c6"), &request("c6", "sleepy", "{}"))
            .await;
        assert!(started.elapsed() < Duration::from_millis(300));
        match invocation.status {
            InvocationStatus::Failed(ToolError::ProviderFailure { message }) => {
                assert!(message.contains("timed out"))
            }
            other => panic!("expected timeout failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatch_survives_panics() {
        let invocation = registry()
            .dispatch(ctx("c7"), &request("c7", "panicky", "{}"))
            .await;
        assert!(matches!(
            invocation.status,
            InvocationStatus::Failed(ToolError::ProviderFailure { .. })
        ));
    }

    #[tokio::test]
    async fn test_dispatch_observes_cancellation() {
        let registry = ToolRegistry::builder()
            .register(Sleepy)
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap();
        let context = ctx("c8");
        let token = context.cancellation().clone();
        let handle = tokio::spawn(async move {
            registry
                .dispatch(context, &request("c8", "sleepy", "{}"))
                .await
        });
        token.cancel();
        let invocation = handle.await.unwrap();
        match invocation.status {
            InvocationStatus::Failed(ToolError::ProviderFailure { message }) => {
                assert!(message.contains("cancelled"))
            }
            other => panic!("expected cancellation failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_context_emit_goes_through_notifier() {
        let emitted = Arc::new(AtomicBool::new(false));
        let flag = emitted.clone();
        let mut notifier = MockSideChannelNotifier::new();
        notifier
            .expect_emit()
            .withf(|_, event| event.kind == SideChannelKind::MediaSuggestion)
            .times(1)
            .returning(move |_, _| flag.store(true, Ordering::SeqCst));

        let context = ToolContext::new(
            Uuid::new_v4(),
            "c9",
            CancellationToken::new(),
            Arc::new(notifier),
        );
        let invocation = registry()
            .dispatch(context, &request("c9", "announcer", "{}"))
            .await;
        assert!(matches!(invocation.status, InvocationStatus::Completed(_)));
        assert!(emitted.load(Ordering::SeqCst));
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let err = ToolRegistry::builder()
            .register(Echo)
            .register(Echo)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::DuplicateTool(name) if name == "echo"));
    }

    #[test]
    fn test_specs_keep_registration_order_and_schema() {
        let registry = registry();
        let names: Vec<_> = registry.specs().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "sleepy", "panicky", "announcer"]);

        let echo = &registry.specs()[0];
        assert_eq!(echo.parameters["type"], "object");
        assert!(echo.parameters["properties"]["text"].is_object());
        assert!(echo.parameters.get("$schema").is_none());
        assert_eq!(echo.parameters["required"][0], "text");
    }
}
