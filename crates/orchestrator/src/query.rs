//! The per-query state machine.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use switchboard_core::error::{InferenceError, QueryError, SessionError};
use switchboard_core::event::{DomainEvent, EventBus, QueryStatus};
use switchboard_core::inference::{Inference, InferenceRequest, ToolInvocation, Usage};
use switchboard_core::message::{Metadata, SessionId, Turn};
use switchboard_core::tool::ToolInvoker;
use switchboard_servers::ToolServerRegistry;
use switchboard_session::{SessionStore, SessionSummary};

/// One incoming query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryRequest {
    pub text: String,

    /// Continue this session; `None` starts a new one.
    #[serde(default)]
    pub session_id: Option<SessionId>,

    /// Stored on the session when a new one is created.
    #[serde(default)]
    pub metadata: Metadata,
}

impl QueryRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn in_session(mut self, id: SessionId) -> Self {
        self.session_id = Some(id);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Result of a completed query.
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub response: String,
    pub session_id: SessionId,
    pub is_new_session: bool,
    pub turn_count: u64,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_invocations: Vec<ToolInvocation>,
}

/// A session with its retained history.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub summary: SessionSummary,
    pub history: Vec<Turn>,
}

/// Runs queries: resolve session, gather tools, infer, commit.
pub struct QueryOrchestrator {
    sessions: Arc<SessionStore>,
    registry: Arc<ToolServerRegistry>,
    inference: Arc<dyn Inference>,
    inference_timeout: Duration,
    event_bus: Option<Arc<EventBus>>,
}

impl QueryOrchestrator {
    pub fn new(
        sessions: Arc<SessionStore>,
        registry: Arc<ToolServerRegistry>,
        inference: Arc<dyn Inference>,
    ) -> Self {
        Self {
            sessions,
            registry,
            inference,
            inference_timeout: Duration::from_secs(120),
            event_bus: None,
        }
    }

    /// Bound each inference call, tool round trips included.
    pub fn with_inference_timeout(mut self, timeout: Duration) -> Self {
        self.inference_timeout = timeout;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn registry(&self) -> &Arc<ToolServerRegistry> {
        &self.registry
    }

    pub async fn query(&self, request: QueryRequest) -> Result<QueryOutcome, QueryError> {
        self.query_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Run one query, giving up with `Cancelled` once `cancel` fires.
    ///
    /// On inference failure, timeout or cancellation the user turn is still
    /// recorded but the session is not touched.
    pub async fn query_with_cancel(
        &self,
        request: QueryRequest,
        cancel: CancellationToken,
    ) -> Result<QueryOutcome, QueryError> {
        let started = Instant::now();
        let QueryRequest {
            text,
            session_id,
            metadata,
        } = request;

        // RESOLVE_SESSION
        let resolved = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.record(session_id.as_ref(), QueryStatus::Cancelled, 0, started);
                return Err(QueryError::Cancelled);
            }
            r = self.sessions.resolve_or_create(session_id.as_ref(), metadata) => r,
        };
        let resolution = match resolved {
            Ok(resolution) => resolution,
            Err(e) => {
                debug!(session_id = ?session_id, error = %e, "Session rejected");
                self.record(session_id.as_ref(), QueryStatus::SessionRejected, 0, started);
                return Err(session_error(e));
            }
        };
        let is_new_session = resolution.is_new();
        let lease = resolution.into_lease();
        let id = lease.id().clone();

        // GATHER_TOOLS
        let tools = self.registry.aggregated_tools().await;
        let history = lease.settled_history().await;
        info!(
            session_id = %id,
            is_new_session,
            history = history.len(),
            tools = tools.len(),
            "Running query"
        );

        // INFER
        let invoker: Arc<dyn ToolInvoker> = self.registry.clone();
        let inference_request = InferenceRequest {
            history,
            tools,
            message: text.clone(),
        };
        let inferred = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(QueryError::Cancelled),
            r = tokio::time::timeout(
                self.inference_timeout,
                self.inference.infer(inference_request, invoker),
            ) => match r {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(e)) => Err(QueryError::Inference(e)),
                Err(_) => Err(QueryError::Inference(InferenceError::Timeout(format!(
                    "no response within {}s",
                    self.inference_timeout.as_secs()
                )))),
            },
        };

        // COMMIT
        let response = match inferred {
            Ok(response) => response,
            Err(e) => {
                warn!(session_id = %id, error = %e, "Query failed; keeping user turn only");
                let turn_count = match self.sessions.commit(&lease, &text, None).await {
                    Ok(session) => session.turn_count,
                    Err(commit_err) => {
                        debug!(session_id = %id, error = %commit_err, "Could not record user turn");
                        0
                    }
                };
                let status = match e {
                    QueryError::Cancelled => QueryStatus::Cancelled,
                    _ => QueryStatus::InferenceFailed,
                };
                self.record(Some(&id), status, turn_count, started);
                return Err(e);
            }
        };

        let session = match self
            .sessions
            .commit(&lease, &text, Some(&response.content))
            .await
        {
            Ok(session) => session,
            Err(e) => {
                // Deleted or expired while inference ran.
                self.record(Some(&id), QueryStatus::SessionRejected, 0, started);
                return Err(session_error(e));
            }
        };
        drop(lease);

        self.record(
            Some(&id),
            QueryStatus::Completed,
            session.turn_count,
            started,
        );
        info!(
            session_id = %id,
            turn_count = session.turn_count,
            duration_ms = started.elapsed().as_millis() as u64,
            "Query completed"
        );

        Ok(QueryOutcome {
            response: response.content,
            session_id: id,
            is_new_session,
            turn_count: session.turn_count,
            model: response.model,
            usage: response.usage,
            tool_invocations: response.tool_invocations,
        })
    }

    /// Metadata and retained history of a live session.
    pub async fn lookup_session(&self, id: &SessionId) -> Result<SessionView, QueryError> {
        let session = self.sessions.get(id).await.map_err(session_error)?;
        Ok(SessionView {
            summary: session.summary(),
            history: session.history.snapshot(),
        })
    }

    /// Remove a session. Returns whether it existed.
    pub async fn delete_session(&self, id: &SessionId) -> bool {
        self.sessions.delete(id).await
    }

    /// Create an empty session with the default TTL.
    pub async fn create_session(&self, metadata: Metadata) -> SessionSummary {
        self.sessions
            .create(self.sessions.default_ttl(), metadata)
            .await
            .summary()
    }

    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        self.sessions.list().await
    }

    fn record(
        &self,
        session_id: Option<&SessionId>,
        status: QueryStatus,
        turn_count: u64,
        started: Instant,
    ) {
        if let Some(bus) = &self.event_bus {
            bus.publish(DomainEvent::QueryCompleted {
                session_id: session_id.map(SessionId::to_string),
                status,
                turn_count,
                duration_ms: started.elapsed().as_millis() as u64,
                timestamp: Utc::now(),
            });
        }
    }
}

fn session_error(e: SessionError) -> QueryError {
    match e {
        SessionError::NotFound(id) => QueryError::SessionExpiredOrUnknown(id),
        other => QueryError::Session(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use switchboard_core::clock::ManualClock;
    use switchboard_core::error::ToolServerError;
    use switchboard_core::inference::InferenceResponse;
    use switchboard_core::message::Role;
    use switchboard_core::tool::{ServerInfo, ToolResult, ToolSpec, ToolTransport};
    use switchboard_servers::{Connector, RetryPolicy, ToolServerEndpoint};

    enum Step {
        Reply(&'static str),
        Fail(InferenceError),
        Hang,
        /// Call `server__tool` once, then reply with the tool output.
        UseTool(&'static str, &'static str),
        Slow(Duration, &'static str),
    }

    /// Plays back scripted steps and records what it was asked.
    struct ScriptedInference {
        steps: Mutex<VecDeque<Step>>,
        seen: Mutex<Vec<InferenceRequest>>,
    }

    impl ScriptedInference {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<InferenceRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Inference for ScriptedInference {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn infer(
            &self,
            request: InferenceRequest,
            tools: Arc<dyn ToolInvoker>,
        ) -> Result<InferenceResponse, InferenceError> {
            self.seen.lock().unwrap().push(request);
            let step = self
                .steps
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Step::Reply("(no more script)"));
            match step {
                Step::Reply(text) => Ok(InferenceResponse::text(text, "scripted-model")),
                Step::Fail(e) => Err(e),
                Step::Hang => std::future::pending().await,
                Step::UseTool(server, tool) => {
                    let result = tools
                        .invoke(server, tool, serde_json::json!({ "q": "x" }))
                        .await
                        .map_err(|e| InferenceError::Network(e.to_string()))?;
                    Ok(InferenceResponse::text(result.output, "scripted-model"))
                }
                Step::Slow(delay, text) => {
                    tokio::time::sleep(delay).await;
                    Ok(InferenceResponse::text(text, "scripted-model"))
                }
            }
        }
    }

    struct EchoTransport;

    #[async_trait]
    impl ToolTransport for EchoTransport {
        async fn handshake(&self) -> Result<ServerInfo, ToolServerError> {
            Ok(ServerInfo::default())
        }

        async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolServerError> {
            Ok(vec![ToolSpec {
                name: "lookup".into(),
                description: "Look something up".into(),
                input_schema: serde_json::json!({ "type": "object" }),
            }])
        }

        async fn call_tool(
            &self,
            name: &str,
            _arguments: serde_json::Value,
        ) -> Result<ToolResult, ToolServerError> {
            Ok(ToolResult {
                success: true,
                output: format!("{name} says hi"),
                data: None,
            })
        }
    }

    struct EchoConnector;

    impl Connector for EchoConnector {
        fn transport(&self, _endpoint: &ToolServerEndpoint) -> Arc<dyn ToolTransport> {
            Arc::new(EchoTransport)
        }
    }

    struct Harness {
        orchestrator: QueryOrchestrator,
        inference: Arc<ScriptedInference>,
        clock: Arc<ManualClock>,
    }

    fn harness(steps: Vec<Step>) -> Harness {
        let clock = Arc::new(ManualClock::default());
        let sessions = Arc::new(
            SessionStore::new(Duration::from_secs(3600), 4).with_clock(clock.clone()),
        );
        let registry = Arc::new(ToolServerRegistry::new(Arc::new(EchoConnector)));
        let inference = ScriptedInference::new(steps);
        let orchestrator = QueryOrchestrator::new(sessions, registry, inference.clone())
            .with_inference_timeout(Duration::from_secs(30));
        Harness {
            orchestrator,
            inference,
            clock,
        }
    }

    #[tokio::test]
    async fn first_query_creates_session() {
        let h = harness(vec![Step::Reply("Hello!")]);

        let outcome = h.orchestrator.query(QueryRequest::new("Hi")).await.unwrap();
        assert!(outcome.is_new_session);
        assert_eq!(outcome.response, "Hello!");
        assert_eq!(outcome.turn_count, 1);

        let view = h.orchestrator.lookup_session(&outcome.session_id).await.unwrap();
        assert_eq!(view.history.len(), 2);
        assert_eq!(view.history[0].role, Role::User);
        assert_eq!(view.history[1].content, "Hello!");
    }

    #[tokio::test]
    async fn follow_up_sees_prior_history() {
        let h = harness(vec![Step::Reply("one"), Step::Reply("two")]);

        let first = h.orchestrator.query(QueryRequest::new("q1")).await.unwrap();
        let second = h
            .orchestrator
            .query(QueryRequest::new("q2").in_session(first.session_id.clone()))
            .await
            .unwrap();

        assert!(!second.is_new_session);
        assert_eq!(second.session_id, first.session_id);
        assert_eq!(second.turn_count, 2);

        let seen = h.inference.seen();
        assert!(seen[0].history.is_empty());
        assert_eq!(seen[1].history.len(), 2);
        assert_eq!(seen[1].message, "q2");
    }

    #[tokio::test]
    async fn unknown_session_is_rejected_without_creating_one() {
        let h = harness(vec![]);

        let err = h
            .orchestrator
            .query(QueryRequest::new("hi").in_session(SessionId::from("missing")))
            .await
            .unwrap_err();
        assert_eq!(err, QueryError::SessionExpiredOrUnknown("missing".into()));
        assert!(h.orchestrator.sessions().is_empty().await);
        assert!(h.inference.seen().is_empty());
    }

    #[tokio::test]
    async fn expired_session_is_rejected() {
        let h = harness(vec![Step::Reply("ok")]);
        let first = h.orchestrator.query(QueryRequest::new("hi")).await.unwrap();

        h.clock.advance(chrono::Duration::hours(2));
        let err = h
            .orchestrator
            .query(QueryRequest::new("again").in_session(first.session_id))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::SessionExpiredOrUnknown(_)));
    }

    #[tokio::test]
    async fn inference_failure_keeps_user_turn_only() {
        let h = harness(vec![
            Step::Reply("first"),
            Step::Fail(InferenceError::Network("boom".into())),
            Step::Reply("recovered"),
        ]);
        let first = h.orchestrator.query(QueryRequest::new("q1")).await.unwrap();
        let id = first.session_id.clone();

        let err = h
            .orchestrator
            .query(QueryRequest::new("q2").in_session(id.clone()))
            .await
            .unwrap_err();
        assert_eq!(err, QueryError::Inference(InferenceError::Network("boom".into())));

        let view = h.orchestrator.lookup_session(&id).await.unwrap();
        assert_eq!(view.summary.turn_count, 1);
        assert_eq!(view.history.len(), 3);
        assert_eq!(view.history[2].content, "q2");

        let third = h
            .orchestrator
            .query(QueryRequest::new("q3").in_session(id.clone()))
            .await
            .unwrap();
        assert_eq!(third.turn_count, 2);

        // inference never saw the dangling user turn
        assert_eq!(h.inference.seen()[2].history.len(), 2);
        let contents: Vec<_> = h
            .orchestrator
            .lookup_session(&id)
            .await
            .unwrap()
            .history
            .into_iter()
            .map(|t| t.content)
            .collect();
        assert_eq!(contents, vec!["q1", "first", "q3", "recovered"]);
    }

    #[tokio::test(start_paused = true)]
    async fn inference_timeout_is_reported() {
        let h = harness(vec![Step::Hang]);
        let err = h.orchestrator.query(QueryRequest::new("hi")).await.unwrap_err();
        assert!(matches!(err, QueryError::Inference(InferenceError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_inference() {
        let h = Arc::new(harness(vec![Step::Hang]));
        let cancel = CancellationToken::new();

        let task = {
            let h = h.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                h.orchestrator
                    .query_with_cancel(QueryRequest::new("hi"), cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        assert_eq!(task.await.unwrap().unwrap_err(), QueryError::Cancelled);
        let sessions = h.orchestrator.list_sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].turn_count, 0);
        assert_eq!(sessions[0].history_len, 1);
    }

    #[tokio::test]
    async fn tools_are_offered_and_invocable() {
        let h = harness(vec![Step::UseTool("kb", "lookup")]);
        h.orchestrator
            .registry()
            .connect_all(
                &[ToolServerEndpoint::new("kb", "http://kb.local/mcp")],
                RetryPolicy::default(),
            )
            .await
            .unwrap();

        let outcome = h.orchestrator.query(QueryRequest::new("find")).await.unwrap();
        assert_eq!(outcome.response, "lookup says hi");

        let seen = h.inference.seen();
        assert_eq!(seen[0].tools.len(), 1);
        assert_eq!(seen[0].tools[0].qualified_name(), "kb__lookup");
    }

    #[tokio::test]
    async fn no_tool_servers_is_not_an_error() {
        let h = harness(vec![Step::Reply("no tools needed")]);
        let outcome = h.orchestrator.query(QueryRequest::new("hi")).await.unwrap();
        assert_eq!(outcome.response, "no tools needed");
        assert!(h.inference.seen()[0].tools.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_queries_on_one_session_serialize() {
        let h = Arc::new(harness(vec![
            Step::Reply("setup"),
            Step::Slow(Duration::from_millis(200), "a"),
            Step::Slow(Duration::from_millis(200), "b"),
        ]));
        let id = h
            .orchestrator
            .query(QueryRequest::new("start"))
            .await
            .unwrap()
            .session_id;

        let mut tasks = Vec::new();
        for text in ["x", "y"] {
            let h = h.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                h.orchestrator
                    .query(QueryRequest::new(text).in_session(id))
                    .await
            }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        let view = h.orchestrator.lookup_session(&id).await.unwrap();
        assert_eq!(view.summary.turn_count, 3);
        // window budget is 4: the two latest exchanges, still alternating
        let roles: Vec<_> = view.history.iter().map(|t| t.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::User, Role::Assistant]
        );
        // the second query saw the first one's exchange
        assert_eq!(h.inference.seen()[2].history.len(), 4);
    }

    #[tokio::test]
    async fn deleted_session_cannot_be_continued() {
        let h = harness(vec![Step::Reply("hello")]);
        let outcome = h.orchestrator.query(QueryRequest::new("hi")).await.unwrap();

        assert!(h.orchestrator.delete_session(&outcome.session_id).await);
        assert!(!h.orchestrator.delete_session(&outcome.session_id).await);
        assert!(matches!(
            h.orchestrator.lookup_session(&outcome.session_id).await,
            Err(QueryError::SessionExpiredOrUnknown(_))
        ));
    }

    #[tokio::test]
    async fn created_session_can_be_queried() {
        let h = harness(vec![Step::Reply("welcome")]);
        let mut metadata = Metadata::new();
        metadata.insert("user_id".into(), serde_json::json!("u-7"));
        let summary = h.orchestrator.create_session(metadata).await;
        assert_eq!(summary.turn_count, 0);

        let outcome = h
            .orchestrator
            .query(QueryRequest::new("hi").in_session(summary.id.clone()))
            .await
            .unwrap();
        assert!(!outcome.is_new_session);
        let view = h.orchestrator.lookup_session(&summary.id).await.unwrap();
        assert_eq!(view.summary.metadata["user_id"], "u-7");
    }

    #[tokio::test]
    async fn query_outcome_event_is_published() {
        let bus = Arc::new(EventBus::new(16));
        let mut rx = bus.subscribe();
        let h = harness(vec![Step::Reply("hi")]);
        let orchestrator = QueryOrchestrator {
            event_bus: Some(bus),
            ..h.orchestrator
        };

        orchestrator.query(QueryRequest::new("hello")).await.unwrap();
        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            DomainEvent::QueryCompleted {
                status, turn_count, ..
            } => {
                assert_eq!(*status, QueryStatus::Completed);
                assert_eq!(*turn_count, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
