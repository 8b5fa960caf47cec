//! Model/tool orchestration for one conversation.
//!
//! Each user turn runs `AwaitingModel -> (ExecutingTools)* -> Settled`:
//! the model sees the whole conversation plus the tool declarations, and
//! either answers with text (the turn settles) or requests invocations,
//! which are executed one by one in the order requested. Their results are
//! appended and the model is consulted again, up to `max_round_trips` times.
//!
//! Tool-level failures (validation, timeout, remote handler errors, unknown
//! tool names) become tool-result text the model can react to. Transport,
//! protocol and model failures end the turn with an error.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Instrument;

use crate::error::{BridgeError, Result};
use crate::schema::{ToolDeclaration, ToolSet};

/// Default bound on model/tool round trips per turn.
pub const DEFAULT_MAX_ROUND_TRIPS: usize = 8;

/// One invocation the model asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub id: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Entry in the append-only conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ConversationMessage {
    User {
        text: String,
    },
    Assistant {
        text: String,
        invocations: Vec<InvocationRequest>,
    },
    ToolResult {
        invocation_id: String,
        text: String,
        is_error: bool,
    },
}

/// Ordered, append-only message history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    messages: Vec<ConversationMessage>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn push(&mut self, message: ConversationMessage) {
        self.messages.push(message);
    }
}

/// What the model answered with.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelReply {
    /// Terminal text; the turn settles.
    Text(String),
    /// Invocations to run, in order.
    Invocations(Vec<InvocationRequest>),
}

/// The external language model.
#[async_trait]
pub trait ModelCollaborator: Send + Sync {
    async fn respond(
        &self,
        conversation: &[ConversationMessage],
        tools: &[ToolDeclaration],
    ) -> anyhow::Result<ModelReply>;
}

/// How a turn settled.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Reply(String),
    /// The round-trip bound was hit before the model produced text.
    LimitExceeded { message: String, round_trips: usize },
}

pub struct ToolLoop {
    model: Arc<dyn ModelCollaborator>,
    tools: ToolSet,
    conversation: Conversation,
    max_round_trips: usize,
    turns: u64,
}

impl ToolLoop {
    /// `max_round_trips` below 1 is raised to 1.
    pub fn new(model: Arc<dyn ModelCollaborator>, tools: ToolSet, max_round_trips: usize) -> Self {
        Self {
            model,
            tools,
            conversation: Conversation::new(),
            max_round_trips: max_round_trips.max(1),
            turns: 0,
        }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn tools(&self) -> &ToolSet {
        &self.tools
    }

    pub fn max_round_trips(&self) -> usize {
        self.max_round_trips
    }

    /// Run one user turn to completion.
    pub async fn run_turn(&mut self, user_text: impl Into<String>) -> Result<TurnOutcome> {
        self.turns += 1;
        let span = tracing::info_span!("turn", turn = self.turns);
        let user_text = user_text.into();
        async move {
            self.conversation
                .push(ConversationMessage::User { text: user_text });
            let declarations = self.tools.declarations();
            let mut round_trips = 0;

            loop {
                if round_trips >= self.max_round_trips {
                    let message = format!(
                        "tool-call limit exceeded: stopped after {round_trips} round trips without a final answer"
                    );
                    tracing::warn!(round_trips, "turn hit the round-trip bound");
                    return Ok(TurnOutcome::LimitExceeded {
                        message,
                        round_trips,
                    });
                }

                let reply = self
                    .model
                    .respond(self.conversation.messages(), &declarations)
                    .await
                    .map_err(BridgeError::model)?;

                let requests = match reply {
                    ModelReply::Text(text) => return Ok(self.settle(text)),
                    ModelReply::Invocations(requests) if requests.is_empty() => {
                        tracing::warn!("model returned an empty invocation list, settling");
                        return Ok(self.settle(String::new()));
                    }
                    ModelReply::Invocations(requests) => requests,
                };

                round_trips += 1;
                tracing::debug!(
                    round_trips,
                    invocations = requests.len(),
                    "executing requested tools"
                );
                self.conversation.push(ConversationMessage::Assistant {
                    text: String::new(),
                    invocations: requests.clone(),
                });
                self.execute(requests).await?;
            }
        }
        .instrument(span)
        .await
    }

    fn settle(&mut self, text: String) -> TurnOutcome {
        tracing::debug!(chars = text.len(), "turn settled");
        self.conversation.push(ConversationMessage::Assistant {
            text: text.clone(),
            invocations: Vec::new(),
        });
        TurnOutcome::Reply(text)
    }

    /// Run `requests` sequentially, appending exactly one result per request.
    ///
    /// After a fatal error the remaining requests are not dispatched but still
    /// receive an error result, then the error is returned.
    async fn execute(&mut self, requests: Vec<InvocationRequest>) -> Result<()> {
        let mut fatal: Option<BridgeError> = None;

        for request in requests {
            let skipped = fatal
                .as_ref()
                .map(|e| format!("Error: not executed, {e}"));
            let (text, is_error) = match skipped {
                Some(text) => (text, true),
                None => match self.resolve(&request).await {
                    Ok(text) => (text, false),
                    Err(e) => {
                        tracing::warn!(tool = %request.tool_name, error = %e, "tool invocation failed");
                        let text = format!("Error: {e}");
                        if e.is_fatal_to_turn() {
                            fatal = Some(e);
                        }
                        (text, true)
                    }
                },
            };
            self.conversation.push(ConversationMessage::ToolResult {
                invocation_id: request.id,
                text,
                is_error,
            });
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn resolve(&self, request: &InvocationRequest) -> Result<String> {
        let Some(tool) = self.tools.get(&request.tool_name) else {
            let known: Vec<&str> = self.tools.iter().map(|t| t.name()).collect();
            return Err(BridgeError::ToolExecution {
                tool: request.tool_name.clone(),
                message: format!("unknown tool; available tools: {}", known.join(", ")),
            });
        };
        tool.call(request.arguments.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{translate, CapabilityDescriptor, Invoke};
    use serde_json::{json, Map};
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Model that replays scripted replies and records what it was shown.
    struct ScriptedModel {
        replies: Mutex<VecDeque<anyhow::Result<ModelReply>>>,
        repeat: Option<ModelReply>,
        seen: Mutex<Vec<Vec<ConversationMessage>>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<anyhow::Result<ModelReply>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                repeat: None,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn repeating(reply: ModelReply) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(VecDeque::new()),
                repeat: Some(reply),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ModelCollaborator for ScriptedModel {
        async fn respond(
            &self,
            conversation: &[ConversationMessage],
            _tools: &[ToolDeclaration],
        ) -> anyhow::Result<ModelReply> {
            self.seen.lock().unwrap().push(conversation.to_vec());
            if let Some(reply) = self.replies.lock().unwrap().pop_front() {
                return reply;
            }
            match &self.repeat {
                Some(reply) => Ok(reply.clone()),
                None => anyhow::bail!("script exhausted"),
            }
        }
    }

    /// Invoker with per-tool canned outcomes and optional delays.
    #[derive(Default)]
    struct FakeServer {
        outcomes: HashMap<String, (Duration, std::result::Result<String, String>)>,
        completed: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    impl FakeServer {
        fn with(mut self, tool: &str, delay_ms: u64, outcome: std::result::Result<&str, &str>) -> Self {
            self.outcomes.insert(
                tool.to_string(),
                (
                    Duration::from_millis(delay_ms),
                    outcome.map(str::to_string).map_err(str::to_string),
                ),
            );
            self
        }
    }

    #[async_trait]
    impl Invoke for FakeServer {
        async fn invoke(&self, name: &str, _arguments: Map<String, Value>) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (delay, outcome) = self
                .outcomes
                .get(name)
                .cloned()
                .unwrap_or((Duration::ZERO, Ok(String::new())));
            tokio::time::sleep(delay).await;
            self.completed.lock().unwrap().push(name.to_string());
            match outcome {
                Ok(text) => Ok(text),
                Err(message) if message == "transport" => {
                    Err(BridgeError::Transport("tool server exited".to_string()))
                }
                Err(message) => Err(BridgeError::ToolExecution {
                    tool: name.to_string(),
                    message,
                }),
            }
        }
    }

    fn descriptor(name: &str, params: Value) -> CapabilityDescriptor {
        CapabilityDescriptor::from_value(json!({
            "name": name,
            "description": format!("{name} tool"),
            "parameters": params,
        }))
        .unwrap()
    }

    fn tool_set(server: Arc<FakeServer>, names: &[&str]) -> ToolSet {
        let mut descriptors = vec![descriptor(
            "search_hotels",
            json!({"query": {"kind": "string", "required": true}}),
        )];
        descriptors.extend(names.iter().map(|n| descriptor(n, json!({}))));
        translate(descriptors, server)
    }

    fn request(id: &str, tool: &str, arguments: Value) -> InvocationRequest {
        InvocationRequest {
            id: id.to_string(),
            tool_name: tool.to_string(),
            arguments,
        }
    }

    fn tool_results(conversation: &Conversation) -> Vec<(String, String, bool)> {
        conversation
            .messages()
            .iter()
            .filter_map(|m| match m {
                ConversationMessage::ToolResult {
                    invocation_id,
                    text,
                    is_error,
                } => Some((invocation_id.clone(), text.clone(), *is_error)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_text_reply_settles_immediately() {
        let model = ScriptedModel::new(vec![Ok(ModelReply::Text("Hello!".into()))]);
        let server = Arc::new(FakeServer::default());
        let mut tool_loop = ToolLoop::new(model.clone(), tool_set(server, &[]), 3);

        let outcome = tool_loop.run_turn("hi").await.unwrap();
        assert_eq!(outcome, TurnOutcome::Reply("Hello!".into()));
        assert_eq!(model.calls(), 1);
        assert_eq!(tool_loop.conversation().len(), 2);
    }

    #[tokio::test]
    async fn test_tool_result_is_fed_back_to_model() {
        let model = ScriptedModel::new(vec![
            Ok(ModelReply::Invocations(vec![request(
                "call-1",
                "search_hotels",
                json!({"query": "Paris"}),
            )])),
            Ok(ModelReply::Text("No hotels found in Paris.".into())),
        ]);
        let server = Arc::new(FakeServer::default().with("search_hotels", 0, Ok("[]")));
        let mut tool_loop = ToolLoop::new(model.clone(), tool_set(server, &[]), 3);

        let outcome = tool_loop.run_turn("Find me a hotel in Paris").await.unwrap();
        assert_eq!(outcome, TurnOutcome::Reply("No hotels found in Paris.".into()));

        let results = tool_results(tool_loop.conversation());
        assert_eq!(results, vec![("call-1".into(), "[]".into(), false)]);

        let seen = model.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(
            matches!(seen[1].last(), Some(ConversationMessage::ToolResult { text, .. }) if text == "[]"),
            "second model call must see the tool result"
        );
    }

    #[tokio::test]
    async fn test_unknown_tool_becomes_result_text() {
        let model = ScriptedModel::new(vec![
            Ok(ModelReply::Invocations(vec![request(
                "call-1",
                "delete_hotel",
                json!({}),
            )])),
            Ok(ModelReply::Text("I cannot delete hotels.".into())),
        ]);
        let server = Arc::new(FakeServer::default());
        let mut tool_loop = ToolLoop::new(model.clone(), tool_set(server.clone(), &[]), 3);

        let outcome = tool_loop.run_turn("delete it").await.unwrap();
        assert_eq!(outcome, TurnOutcome::Reply("I cannot delete hotels.".into()));

        let results = tool_results(tool_loop.conversation());
        assert_eq!(results.len(), 1);
        assert!(results[0].1.contains("unknown tool"), "got: {}", results[0].1);
        assert!(results[0].1.contains("delete_hotel"));
        assert!(results[0].2);
        assert_eq!(server.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_round_trip_bound() {
        let model = ScriptedModel::repeating(ModelReply::Invocations(vec![request(
            "call",
            "search_hotels",
            json!({"query": "Paris"}),
        )]));
        let server = Arc::new(FakeServer::default().with("search_hotels", 0, Ok("[]")));
        let mut tool_loop = ToolLoop::new(model.clone(), tool_set(server.clone(), &[]), 3);

        let outcome = tool_loop.run_turn("loop forever").await.unwrap();
        match outcome {
            TurnOutcome::LimitExceeded {
                message,
                round_trips,
            } => {
                assert_eq!(round_trips, 3);
                assert!(message.contains("limit exceeded"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(model.calls(), 3, "model must not be called a 4th time");
        assert_eq!(server.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_results_follow_request_order() {
        let model = ScriptedModel::new(vec![
            Ok(ModelReply::Invocations(vec![
                request("a", "slow", json!({})),
                request("b", "medium", json!({})),
                request("c", "fast", json!({})),
            ])),
            Ok(ModelReply::Text("done".into())),
        ]);
        let server = Arc::new(
            FakeServer::default()
                .with("slow", 60, Ok("A"))
                .with("medium", 30, Ok("B"))
                .with("fast", 0, Ok("C")),
        );
        let mut tool_loop = ToolLoop::new(
            model,
            tool_set(server.clone(), &["slow", "medium", "fast"]),
            3,
        );

        tool_loop.run_turn("go").await.unwrap();
        let ids: Vec<_> = tool_results(tool_loop.conversation())
            .into_iter()
            .map(|(id, text, _)| (id, text))
            .collect();
        assert_eq!(
            ids,
            vec![
                ("a".to_string(), "A".to_string()),
                ("b".to_string(), "B".to_string()),
                ("c".to_string(), "C".to_string()),
            ]
        );
        assert_eq!(
            *server.completed.lock().unwrap(),
            vec!["slow", "medium", "fast"]
        );
    }

    #[tokio::test]
    async fn test_tool_failures_do_not_abort_turn() {
        let model = ScriptedModel::new(vec![
            Ok(ModelReply::Invocations(vec![
                request("1", "book_hotel", json!({})),
                request("2", "search_hotels", json!({})),
            ])),
            Ok(ModelReply::Text("Booking failed, try another date.".into())),
        ]);
        let server = Arc::new(FakeServer::default().with("book_hotel", 0, Err("no rooms left")));
        let mut tool_loop = ToolLoop::new(model, tool_set(server.clone(), &["book_hotel"]), 3);

        let outcome = tool_loop.run_turn("book").await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Reply(_)));

        let results = tool_results(tool_loop.conversation());
        assert!(results[0].1.contains("no rooms left"));
        assert!(results[1].1.contains("missing required parameter 'query'"));
        assert!(results.iter().all(|(_, _, is_error)| *is_error));
        assert_eq!(
            server.calls.load(Ordering::SeqCst),
            1,
            "invalid call must not be dispatched"
        );
    }

    #[tokio::test]
    async fn test_transport_failure_ends_turn_with_complete_results() {
        let model = ScriptedModel::new(vec![Ok(ModelReply::Invocations(vec![
            request("1", "first", json!({})),
            request("2", "second", json!({})),
            request("3", "third", json!({})),
        ]))]);
        let server = Arc::new(
            FakeServer::default()
                .with("first", 0, Ok("ok"))
                .with("second", 0, Err("transport")),
        );
        let mut tool_loop = ToolLoop::new(
            model.clone(),
            tool_set(server.clone(), &["first", "second", "third"]),
            3,
        );

        let err = tool_loop.run_turn("go").await.unwrap_err();
        assert!(matches!(err, BridgeError::Transport(_)));
        assert_eq!(model.calls(), 1);

        let results = tool_results(tool_loop.conversation());
        assert_eq!(results.len(), 3, "every invocation gets a result");
        assert!(!results[0].2);
        assert!(results[1].2 && results[2].2);
        assert!(results[2].1.contains("not executed"));
        assert_eq!(server.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_model_failure_is_fatal() {
        let model = ScriptedModel::new(vec![Err(anyhow::anyhow!("rate limited"))]);
        let server = Arc::new(FakeServer::default());
        let mut tool_loop = ToolLoop::new(model, tool_set(server, &[]), 3);

        let err = tool_loop.run_turn("hi").await.unwrap_err();
        assert!(matches!(err, BridgeError::Model(_)));
        assert!(err.to_string().contains("rate limited"));
        assert_eq!(tool_loop.conversation().len(), 1);
    }

    #[tokio::test]
    async fn test_conversation_carries_across_turns() {
        let model = ScriptedModel::new(vec![
            Ok(ModelReply::Text("first".into())),
            Ok(ModelReply::Text("second".into())),
        ]);
        let server = Arc::new(FakeServer::default());
        let mut tool_loop = ToolLoop::new(model.clone(), tool_set(server, &[]), 3);

        tool_loop.run_turn("one").await.unwrap();
        tool_loop.run_turn("two").await.unwrap();

        let seen = model.seen.lock().unwrap();
        assert_eq!(seen[1].len(), 3, "second turn sees the first exchange");
        assert_eq!(
            seen[1][0],
            ConversationMessage::User {
                text: "one".into()
            }
        );
    }

    #[test]
    fn test_zero_bound_is_raised_to_one() {
        let model = ScriptedModel::new(vec![]);
        let tool_loop = ToolLoop::new(model, ToolSet::default(), 0);
        assert_eq!(tool_loop.max_round_trips(), 1);
    }

    #[test]
    fn test_message_serialization_is_tagged() {
        let message = ConversationMessage::ToolResult {
            invocation_id: "call-1".into(),
            text: "[]".into(),
            is_error: false,
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["role"], "tool_result");
        assert_eq!(value["invocation_id"], "call-1");
    }
}
