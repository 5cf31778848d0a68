//! One question-and-answer turn.
//!
//! 1. Read the recent turns of the conversation (or take the caller's
//!    history when server-side memory is off) and render the model input.
//! 2. Call the model; execute any requested tool calls and loop until it
//!    answers in text or the iteration limit is hit.
//! 3. Persist the user question and the answer as a single write, so a
//!    failed or dropped request cannot leave half a turn behind.
//! 4. Kick off compaction in the background.

use esquire_config::AppConfig;
use esquire_core::message::{ConversationId, Message};
use esquire_core::provider::{Provider, ProviderRequest, Usage};
use esquire_core::tool::{ToolCall, ToolRegistry};
use esquire_memory::{MaintenanceScheduler, MemoryHandles};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::context::{HistoryTurn, build_fallback_input, build_input};

pub const DEFAULT_INSTRUCTIONS: &str = "You are Esmeralda, a legal assistant for {name}. \
Answer only from the regulation fragments returned by the search_law tool. \
Search once per legal concept, cite the regulation and section you rely on, \
and say so plainly when the fragments do not answer the question.";

const ITERATION_LIMIT_ANSWER: &str =
    "I could not finish researching this question. Please narrow it down and ask again.";

/// Input to [`TurnRunner::run`].
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub conversation_id: ConversationId,
    pub prompt: String,
    /// Substituted for `{name}` in the instructions.
    pub user_name: String,
    /// Used only when server-side memory is disabled.
    pub fallback_history: Vec<HistoryTurn>,
}

impl TurnRequest {
    pub fn new(conversation_id: ConversationId, prompt: impl Into<String>) -> Self {
        Self {
            conversation_id,
            prompt: prompt.into(),
            user_name: String::new(),
            fallback_history: Vec::new(),
        }
    }
}

/// The answer plus what it cost, for the caller's accounting.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub answer: String,
    pub model: String,
    pub usage: Usage,
    pub iterations: u32,
    pub tool_calls: usize,
}

pub struct TurnRunner {
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    memory: MemoryHandles,
    scheduler: Arc<MaintenanceScheduler>,
    model: String,
    instructions: String,
    context_limit: usize,
    max_iterations: u32,
}

impl TurnRunner {
    pub fn new(
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        memory: MemoryHandles,
        config: &AppConfig,
    ) -> Self {
        let scheduler = Arc::new(memory.scheduler(config.memory.vacuum_interval_hours));
        Self {
            provider,
            tools,
            memory,
            scheduler,
            model: config.agent.model.clone(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            context_limit: config.memory.context_limit,
            max_iterations: config.agent.max_iterations,
        }
    }

    /// Replace the system instructions. `{name}` is filled per request.
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn scheduler(&self) -> &Arc<MaintenanceScheduler> {
        &self.scheduler
    }

    pub async fn run(&self, request: TurnRequest) -> esquire_core::Result<TurnOutcome> {
        let conversations = &self.memory.conversations;
        info!(
            conversation_id = %request.conversation_id,
            memory = conversations.name(),
            "Processing turn"
        );

        let input = if conversations.is_enabled() {
            let history = conversations
                .recent_context(&request.conversation_id, self.context_limit)
                .await?;
            debug!(turns = history.len(), "Loaded conversation context");
            build_input(&history, &request.prompt)
        } else {
            let skip = request.fallback_history.len().saturating_sub(self.context_limit);
            build_fallback_input(&request.fallback_history[skip..], &request.prompt)
        };

        let instructions = self.instructions.replace("{name}", &request.user_name);
        let mut messages = vec![Message::system(instructions), Message::user(input)];
        let tool_definitions = self.tools.definitions();

        let mut usage = Usage::default();
        let mut model = self.model.clone();
        let mut tool_calls = 0;
        let mut iteration = 0;

        let answer = loop {
            iteration += 1;
            if iteration > self.max_iterations {
                warn!(
                    conversation_id = %request.conversation_id,
                    iterations = self.max_iterations,
                    "Max tool iterations reached"
                );
                break ITERATION_LIMIT_ANSWER.to_string();
            }

            let response = self
                .provider
                .complete(ProviderRequest {
                    model: self.model.clone(),
                    messages: messages.clone(),
                    tools: tool_definitions.clone(),
                })
                .await?;

            if let Some(u) = &response.usage {
                usage.add(u);
            }
            model = response.model.clone();

            if response.message.tool_calls.is_empty() {
                break response.message.content;
            }

            debug!(
                tool_count = response.message.tool_calls.len(),
                iteration,
                "Executing tool calls"
            );
            let calls = response.message.tool_calls.clone();
            messages.push(response.message);

            for tc in &calls {
                tool_calls += 1;
                let call = ToolCall {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    arguments: serde_json::from_str(&tc.arguments).unwrap_or_default(),
                };
                match self.tools.execute(&call).await {
                    Ok(result) => messages.push(Message::tool_result(&tc.id, result.output)),
                    Err(e) => {
                        warn!(tool = %tc.name, error = %e, "Tool execution failed");
                        // Let the model see the failure and recover.
                        messages.push(Message::tool_result(&tc.id, format!("Error: {e}")));
                    }
                }
            }
        };

        if conversations.is_enabled() {
            self.persist(&request.conversation_id, &request.prompt, &answer).await?;
            // Detached; the outcome is logged by the scheduler.
            drop(self.scheduler.spawn());
        }

        Ok(TurnOutcome {
            answer,
            model,
            usage,
            iterations: iteration.min(self.max_iterations),
            tool_calls,
        })
    }

    /// Store the question and answer as one write. Runs on its own task so
    /// that cancelling the caller does not abort it.
    async fn persist(
        &self,
        id: &ConversationId,
        prompt: &str,
        answer: &str,
    ) -> esquire_core::Result<()> {
        let store = Arc::clone(&self.memory.conversations);
        let id = id.clone();
        let prompt = prompt.to_string();
        let answer = answer.to_string();

        let handle =
            tokio::spawn(async move { store.append_exchange(&id, &prompt, &answer).await });

        handle
            .await
            .map_err(|e| esquire_core::Error::Internal(format!("persist task failed: {e}")))??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use esquire_core::error::{MemoryError, ProviderError, ToolError};
    use esquire_core::memory::{ConversationStore, MemoryRecord, RetentionStore, TurnRole};
    use esquire_core::message::MessageToolCall;
    use esquire_core::provider::ProviderResponse;
    use esquire_core::tool::{Tool, ToolResult};
    use esquire_memory::InMemoryStore;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted responses and records every request.
    struct ScriptedProvider {
        script: Mutex<VecDeque<Message>>,
        requests: Mutex<Vec<ProviderRequest>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Message>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<ProviderRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            self.requests.lock().unwrap().push(request);
            let message = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Message::assistant("(script exhausted)"));
            Ok(ProviderResponse {
                message,
                usage: Some(Usage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 }),
                model: "scripted-model".into(),
            })
        }
    }

    fn calling(name: &str, arguments: &str) -> Message {
        let mut msg = Message::assistant("");
        msg.tool_calls.push(MessageToolCall {
            id: format!("call_{name}"),
            name: name.into(),
            arguments: arguments.into(),
        });
        msg
    }

    /// Echoes the query back as the tool output.
    struct EchoSearch;

    #[async_trait]
    impl Tool for EchoSearch {
        fn name(&self) -> &str {
            "search_law"
        }
        fn description(&self) -> &str {
            "echo"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({ "type": "object" })
        }
        async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
            Ok(ToolResult {
                call_id: String::new(),
                success: true,
                output: format!("fragments for {}", arguments["query"].as_str().unwrap_or("?")),
                data: None,
            })
        }
    }

    fn registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoSearch));
        Arc::new(registry)
    }

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.agent.max_iterations = 3;
        config.memory.context_limit = 4;
        config
    }

    #[tokio::test]
    async fn answers_and_persists_turn() {
        let store = Arc::new(InMemoryStore::new(200));
        let memory = MemoryHandles { conversations: store.clone(), retention: store.clone() };
        let provider = ScriptedProvider::new(vec![Message::assistant("Lehota je 15 dní.")]);
        let runner = TurnRunner::new(provider.clone(), registry(), memory, &config());

        let id = ConversationId::from("uid-1");
        let outcome = runner.run(TurnRequest::new(id.clone(), "Aká je lehota na odvolanie?")).await.unwrap();
        assert_eq!(outcome.answer, "Lehota je 15 dní.");
        assert_eq!(outcome.usage.total_tokens, 15);
        assert_eq!(outcome.model, "scripted-model");

        let stored = store.recent_context(&id, 10).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].role, TurnRole::User);
        assert_eq!(stored[0].content, "Aká je lehota na odvolanie?");
        assert_eq!(stored[1].role, TurnRole::Assistant);

        // First turn has no history, so the prompt goes through bare.
        assert_eq!(provider.requests()[0].messages[1].content, "Aká je lehota na odvolanie?");
    }

    #[tokio::test]
    async fn second_turn_sees_memory_block() {
        let memory = MemoryHandles::in_memory(200);
        let provider = ScriptedProvider::new(vec![Message::assistant("Áno."), Message::assistant("30 dní.")]);
        let runner = TurnRunner::new(provider.clone(), registry(), memory, &config());

        let id = ConversationId::from("uid-2");
        runner.run(TurnRequest::new(id.clone(), "Mám nárok na dovolenku?")).await.unwrap();
        runner.run(TurnRequest::new(id, "Koľko dní?")).await.unwrap();

        let input = &provider.requests()[1].messages[1].content;
        assert!(input.starts_with("[MEMORY]\nuser: Mám nárok na dovolenku?\nassistant: Áno.\n[/MEMORY]"));
        assert!(input.ends_with("[USER QUESTION]\nKoľko dní?"));
    }

    #[tokio::test]
    async fn tool_calls_loop_until_text() {
        let memory = MemoryHandles::in_memory(200);
        let provider = ScriptedProvider::new(vec![
            calling("search_law", r#"{"query":"dedenie"}"#),
            Message::assistant("Podľa § 473 Občianskeho zákonníka..."),
        ]);
        let runner = TurnRunner::new(provider.clone(), registry(), memory, &config());

        let outcome = runner
            .run(TurnRequest::new(ConversationId::from("uid-3"), "Kto dedí zo zákona?"))
            .await
            .unwrap();
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.tool_calls, 1);
        assert_eq!(outcome.usage.total_tokens, 30);

        let second = &provider.requests()[1];
        let tool_msg = second.messages.last().unwrap();
        assert_eq!(tool_msg.content, "fragments for dedenie");
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_search_law"));
        assert_eq!(second.tools.len(), 1);
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_to_model() {
        let provider = ScriptedProvider::new(vec![calling("nope", "{}"), Message::assistant("ok")]);
        let runner = TurnRunner::new(provider.clone(), registry(), MemoryHandles::in_memory(200), &config());

        runner.run(TurnRequest::new(ConversationId::from("u"), "q")).await.unwrap();
        let tool_msg = provider.requests()[1].messages.last().unwrap().clone();
        assert!(tool_msg.content.starts_with("Error: Tool not found"));
    }

    #[tokio::test]
    async fn iteration_limit_stops_loop() {
        let script = (0..10).map(|_| calling("search_law", r#"{"query":"x"}"#)).collect();
        let provider = ScriptedProvider::new(script);
        let runner = TurnRunner::new(provider.clone(), registry(), MemoryHandles::in_memory(200), &config());

        let outcome = runner.run(TurnRequest::new(ConversationId::from("u"), "q")).await.unwrap();
        assert_eq!(outcome.answer, ITERATION_LIMIT_ANSWER);
        assert_eq!(provider.requests().len(), 3);
        assert_eq!(outcome.iterations, 3);
    }

    #[tokio::test]
    async fn disabled_memory_uses_fallback_history() {
        let provider = ScriptedProvider::new(vec![Message::assistant("ok")]);
        let runner = TurnRunner::new(provider.clone(), registry(), MemoryHandles::disabled(), &config())
            .with_instructions("Assistant for {name}.");

        let mut request = TurnRequest::new(ConversationId::from("u"), "and now?");
        request.user_name = "Jana".into();
        request.fallback_history = (0..6).map(|i| HistoryTurn::new("user", format!("old {i}"))).collect();
        runner.run(request).await.unwrap();

        let sent = &provider.requests()[0];
        assert_eq!(sent.messages[0].content, "Assistant for Jana.");
        let input = &sent.messages[1].content;
        // context_limit is 4: the two oldest turns are left out.
        assert!(!input.contains("old 1"));
        assert!(input.contains("user: old 2"));
        assert!(input.contains("user: old 5"));
    }

    fn locked() -> MemoryError {
        MemoryError::Contention { attempts: 3, reason: "database is locked".into() }
    }

    /// Fails every read with contention.
    struct Contended;

    #[async_trait]
    impl ConversationStore for Contended {
        fn name(&self) -> &str {
            "contended"
        }
        async fn recent_context(
            &self,
            _id: &ConversationId,
            _limit: usize,
        ) -> Result<Vec<MemoryRecord>, MemoryError> {
            Err(locked())
        }
        async fn append(
            &self,
            _id: &ConversationId,
            _role: TurnRole,
            _content: &str,
        ) -> Result<(), MemoryError> {
            Ok(())
        }
        async fn append_exchange(
            &self,
            _id: &ConversationId,
            _question: &str,
            _answer: &str,
        ) -> Result<(), MemoryError> {
            Ok(())
        }
        async fn row_count(&self, _id: &ConversationId) -> Result<usize, MemoryError> {
            Ok(0)
        }
        async fn trim_oldest(&self, _id: &ConversationId, _keep: usize) -> Result<usize, MemoryError> {
            Ok(0)
        }
    }

    /// Reads and single-turn appends reach the inner store; whole-exchange
    /// writes lose the lock.
    struct LockedOnExchange(InMemoryStore);

    #[async_trait]
    impl ConversationStore for LockedOnExchange {
        fn name(&self) -> &str {
            "locked_on_exchange"
        }
        async fn recent_context(
            &self,
            id: &ConversationId,
            limit: usize,
        ) -> Result<Vec<MemoryRecord>, MemoryError> {
            self.0.recent_context(id, limit).await
        }
        async fn append(
            &self,
            id: &ConversationId,
            role: TurnRole,
            content: &str,
        ) -> Result<(), MemoryError> {
            self.0.append(id, role, content).await
        }
        async fn append_exchange(
            &self,
            _id: &ConversationId,
            _question: &str,
            _answer: &str,
        ) -> Result<(), MemoryError> {
            Err(locked())
        }
        async fn row_count(&self, id: &ConversationId) -> Result<usize, MemoryError> {
            self.0.row_count(id).await
        }
        async fn trim_oldest(&self, id: &ConversationId, keep: usize) -> Result<usize, MemoryError> {
            self.0.trim_oldest(id, keep).await
        }
    }

    #[tokio::test]
    async fn contention_surfaces_to_caller() {
        let retention: Arc<dyn RetentionStore> = Arc::new(InMemoryStore::default());
        let memory = MemoryHandles { conversations: Arc::new(Contended), retention };
        let provider = ScriptedProvider::new(vec![Message::assistant("never")]);
        let runner = TurnRunner::new(provider.clone(), registry(), memory, &config());

        let err = runner.run(TurnRequest::new(ConversationId::from("u"), "q")).await.unwrap_err();
        assert!(matches!(err, esquire_core::Error::Memory(MemoryError::Contention { attempts: 3, .. })));
        assert!(provider.requests().is_empty());
    }

    #[tokio::test]
    async fn failed_persist_leaves_no_half_turn() {
        let store = Arc::new(LockedOnExchange(InMemoryStore::new(200)));
        let retention: Arc<dyn RetentionStore> = Arc::new(InMemoryStore::default());
        let memory = MemoryHandles { conversations: store.clone(), retention };
        let provider = ScriptedProvider::new(vec![Message::assistant("a"), Message::assistant("a")]);
        let runner = TurnRunner::new(provider, registry(), memory, &config());

        // The caller retries a transient failure; neither attempt may leave a turn behind.
        let id = ConversationId::from("u");
        for _ in 0..2 {
            let err = runner.run(TurnRequest::new(id.clone(), "question")).await.unwrap_err();
            assert!(matches!(err, esquire_core::Error::Memory(ref e) if e.is_transient()));
        }
        assert!(store.recent_context(&id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn provider_failure_persists_nothing() {
        struct Offline;

        #[async_trait]
        impl Provider for Offline {
            fn name(&self) -> &str {
                "offline"
            }
            async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
                Err(ProviderError::Network("connection refused".into()))
            }
        }

        let store = Arc::new(InMemoryStore::new(200));
        let memory = MemoryHandles { conversations: store.clone(), retention: store.clone() };
        let runner = TurnRunner::new(Arc::new(Offline), registry(), memory, &config());

        let id = ConversationId::from("u");
        let err = runner.run(TurnRequest::new(id.clone(), "q")).await.unwrap_err();
        assert!(matches!(err, esquire_core::Error::Provider(ProviderError::Network(_))));
        assert_eq!(store.row_count(&id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn persisted_turn_triggers_compaction() {
        let store = Arc::new(InMemoryStore::new(200));
        let memory = MemoryHandles { conversations: store.clone(), retention: store.clone() };
        let runner = TurnRunner::new(
            ScriptedProvider::new(vec![Message::assistant("ok")]),
            registry(),
            memory,
            &config(),
        );

        runner.run(TurnRequest::new(ConversationId::from("u"), "q")).await.unwrap();
        // Compaction runs on a detached task.
        for _ in 0..50 {
            if store.compactions() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(store.compactions(), 1);
    }
}
