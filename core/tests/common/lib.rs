//! Scripted collaborators and wait helpers for `mission-core` integration
//! tests.

use std::collections::VecDeque;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use mission_core::ApprovalQueue;
use mission_core::Backends;
use mission_core::InMemorySessionStore;
use mission_core::ManagerServices;
use mission_core::PromptQueue;
use mission_core::RestartPolicy;
use mission_core::SecretRedactor;
use mission_core::SessionManager;
use mission_core::SessionSnapshot;
use mission_core::agent::AgentQuery;
use mission_core::agent::PermissionRequest;
use mission_core::agent::QueryClient;
use mission_core::agent::QueryError;
use mission_core::agent::QueryMessage;
use mission_core::agent::QueryRequest;
use mission_core::agent::QueryResult;
use mission_core::agent::TaskRunner;
use mission_core::agent::TokenUsage;
use mission_core::agent::WorkerError;
use mission_core::agent::WorkerReport;
use mission_core::agent::WorkerTask;
use mission_core::approval::AutoApproval;
use mission_core::approval::ApprovalError;
use mission_core::backend::StreamingBackend;
use mission_core::backend::TerminalBackend;
use mission_core::backend::WorkerBackend;
use mission_core::config::TerminalSettings;
use mission_core::config::WorkerSettings;
use mission_core::permission::PermissionDecision;
use mission_protocol::OutboundEvent;
use mission_protocol::SessionId;
use mission_protocol::SessionStatus;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// One step of a scripted query.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Message(QueryMessage),
    /// `next_message` fails with an upstream error.
    Fail(String),
    Sleep(Duration),
    /// Never yields again; only cancellation ends the run.
    Hang,
}

/// Query client that replays one script per `start` call. When the scripts
/// run out the fallback script is used.
pub struct FakeQueryClient {
    scripts: Mutex<VecDeque<Vec<ScriptStep>>>,
    fallback: Vec<ScriptStep>,
    requests: Mutex<Vec<QueryRequest>>,
    decisions: Arc<Mutex<Vec<(String, PermissionDecision)>>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl FakeQueryClient {
    pub fn new(scripts: Vec<Vec<ScriptStep>>) -> Self {
        Self::with_fallback(scripts, Vec::new())
    }

    pub fn with_fallback(scripts: Vec<Vec<ScriptStep>>, fallback: Vec<ScriptStep>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            fallback,
            requests: Mutex::new(Vec::new()),
            decisions: Arc::new(Mutex::new(Vec::new())),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn requests(&self) -> Vec<QueryRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn start_count(&self) -> usize {
        self.requests().len()
    }

    /// Tool name and decision for every permission answered so far.
    pub fn decisions(&self) -> Vec<(String, PermissionDecision)> {
        self.decisions.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// Highest number of queries that were open at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueryClient for FakeQueryClient {
    async fn start(&self, request: QueryRequest) -> Result<Box<dyn AgentQuery>, QueryError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        let script = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut scripts| scripts.pop_front())
            .unwrap_or_else(|| self.fallback.clone());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        Ok(Box::new(FakeQuery {
            steps: script.into(),
            decisions: Arc::clone(&self.decisions),
            active: Arc::clone(&self.active),
            closed: false,
        }))
    }
}

struct FakeQuery {
    steps: VecDeque<ScriptStep>,
    decisions: Arc<Mutex<Vec<(String, PermissionDecision)>>>,
    active: Arc<AtomicUsize>,
    closed: bool,
}

impl Drop for FakeQuery {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AgentQuery for FakeQuery {
    async fn next_message(&mut self) -> Option<Result<QueryMessage, QueryError>> {
        loop {
            if self.closed {
                return None;
            }
            match self.steps.pop_front()? {
                ScriptStep::Message(message) => return Some(Ok(message)),
                ScriptStep::Fail(message) => return Some(Err(QueryError::Upstream(message))),
                ScriptStep::Sleep(duration) => tokio::time::sleep(duration).await,
                ScriptStep::Hang => std::future::pending::<()>().await,
            }
        }
    }

    async fn respond_permission(
        &mut self,
        request: &PermissionRequest,
        decision: &PermissionDecision,
    ) -> Result<(), QueryError> {
        if let Ok(mut decisions) = self.decisions.lock() {
            decisions.push((request.tool_name.clone(), decision.clone()));
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

/// Worker runner that returns scripted reports in order. An empty script
/// waits for cancellation.
pub struct FakeTaskRunner {
    reports: Mutex<VecDeque<WorkerReport>>,
    tasks: Mutex<Vec<WorkerTask>>,
}

impl FakeTaskRunner {
    pub fn new(reports: Vec<WorkerReport>) -> Self {
        Self {
            reports: Mutex::new(reports.into()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn tasks(&self) -> Vec<WorkerTask> {
        self.tasks.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl TaskRunner for FakeTaskRunner {
    async fn run_task(
        &self,
        task: WorkerTask,
        cancel: CancellationToken,
    ) -> Result<WorkerReport, WorkerError> {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
        let next = self.reports.lock().ok().and_then(|mut r| r.pop_front());
        match next {
            Some(report) => Ok(report),
            None => {
                cancel.cancelled().await;
                Err(WorkerError::Cancelled)
            }
        }
    }
}

/// [`PromptQueue`] that counts how often it was consulted.
#[derive(Default)]
pub struct CountingApprovals {
    pub queue: PromptQueue,
    enqueued: AtomicUsize,
    auto: AtomicUsize,
}

impl CountingApprovals {
    pub fn enqueued(&self) -> usize {
        self.enqueued.load(Ordering::SeqCst)
    }

    pub fn auto_checks(&self) -> usize {
        self.auto.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ApprovalQueue for CountingApprovals {
    async fn enqueue_and_wait(
        &self,
        session_id: &SessionId,
        question: &str,
        options: &[String],
    ) -> Result<String, ApprovalError> {
        self.enqueued.fetch_add(1, Ordering::SeqCst);
        self.queue
            .enqueue_and_wait(session_id, question, options)
            .await
    }

    async fn try_auto_approve(&self, session_id: &SessionId, question: &str) -> AutoApproval {
        self.auto.fetch_add(1, Ordering::SeqCst);
        self.queue.try_auto_approve(session_id, question).await
    }

    fn answer(&self, session_id: &SessionId, prompt_id: Option<&str>, value: &str) -> bool {
        self.queue.answer(session_id, prompt_id, value)
    }

    fn cancel_session(&self, session_id: &SessionId) {
        self.queue.cancel_session(session_id);
    }
}

/// A manager over fakes, with fast restarts and an in-memory store.
pub struct Harness {
    pub manager: SessionManager,
    pub client: Arc<FakeQueryClient>,
    pub runner: Arc<FakeTaskRunner>,
    pub approvals: Arc<CountingApprovals>,
    pub store: Arc<InMemorySessionStore>,
}

pub struct HarnessBuilder {
    client: FakeQueryClient,
    runner: FakeTaskRunner,
    terminal: TerminalSettings,
    secrets: Vec<String>,
    restart: RestartPolicy,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            client: FakeQueryClient::new(Vec::new()),
            runner: FakeTaskRunner::new(Vec::new()),
            terminal: TerminalSettings::default(),
            secrets: Vec::new(),
            restart: RestartPolicy::new(Duration::from_millis(5), Duration::from_millis(20)),
        }
    }
}

impl HarnessBuilder {
    pub fn client(mut self, client: FakeQueryClient) -> Self {
        self.client = client;
        self
    }

    pub fn runner(mut self, runner: FakeTaskRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn terminal(mut self, settings: TerminalSettings) -> Self {
        self.terminal = settings;
        self
    }

    pub fn secrets<I, S>(mut self, secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.secrets = secrets.into_iter().map(Into::into).collect();
        self
    }

    pub fn restart(mut self, policy: RestartPolicy) -> Self {
        self.restart = policy;
        self
    }

    pub fn build(self) -> anyhow::Result<Harness> {
        let client = Arc::new(self.client);
        let runner = Arc::new(self.runner);
        let approvals = Arc::new(CountingApprovals::default());
        let store = Arc::new(InMemorySessionStore::new());
        let backends = Backends {
            streaming: Arc::new(StreamingBackend::new(
                Arc::clone(&client) as Arc<dyn QueryClient>
            )),
            terminal: Arc::new(TerminalBackend::new(self.terminal)?),
            worker: Arc::new(WorkerBackend::new(
                Arc::clone(&runner) as Arc<dyn TaskRunner>,
                &WorkerSettings::default(),
            )),
        };
        let manager = SessionManager::new(ManagerServices {
            backends,
            approvals: Arc::clone(&approvals) as Arc<dyn ApprovalQueue>,
            store: Arc::clone(&store) as Arc<dyn mission_core::SessionStore>,
            redactor: Arc::new(SecretRedactor::new(self.secrets, 4)),
            restart: self.restart,
            output_buffer_max_bytes: 64 * 1024,
        });
        Ok(Harness {
            manager,
            client,
            runner,
            approvals,
            store,
        })
    }
}

pub fn harness() -> HarnessBuilder {
    HarnessBuilder::default()
}

/// Poll until `predicate` holds for the session or the timeout expires.
pub async fn wait_for_session<F>(
    manager: &SessionManager,
    id: &SessionId,
    mut predicate: F,
) -> anyhow::Result<SessionSnapshot>
where
    F: FnMut(&SessionSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        let snapshot = manager.get_session(id)?;
        if predicate(&snapshot) {
            return Ok(snapshot);
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!(
                "timed out waiting for session {id}; last status {}",
                snapshot.record.status
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_status(
    manager: &SessionManager,
    id: &SessionId,
    status: SessionStatus,
) -> anyhow::Result<SessionSnapshot> {
    wait_for_session(manager, id, |s| s.record.status == status).await
}

/// Receive events until one matches. Lagged receivers keep going.
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<OutboundEvent>,
    mut predicate: F,
) -> anyhow::Result<OutboundEvent>
where
    F: FnMut(&OutboundEvent) -> bool,
{
    with_timeout(async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return Ok(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    anyhow::bail!("event stream closed")
                }
            }
        }
    })
    .await?
}

pub async fn with_timeout<F, T>(future: F) -> anyhow::Result<T>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(WAIT_TIMEOUT, future)
        .await
        .context("timed out")
}

/// Every event received so far without waiting.
pub fn drain_events(events: &mut broadcast::Receiver<OutboundEvent>) -> Vec<OutboundEvent> {
    let mut out = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => out.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => return out,
        }
    }
}

pub fn init(conversation_id: &str) -> ScriptStep {
    ScriptStep::Message(QueryMessage::Init {
        conversation_id: conversation_id.to_string(),
        model: None,
    })
}

pub fn text(message_id: &str, text: &str) -> ScriptStep {
    ScriptStep::Message(QueryMessage::Text {
        message_id: Some(message_id.to_string()),
        text: text.to_string(),
        partial: false,
    })
}

/// A streamed text delta of `message_id`.
pub fn delta(message_id: &str, text: &str) -> ScriptStep {
    ScriptStep::Message(QueryMessage::Text {
        message_id: Some(message_id.to_string()),
        text: text.to_string(),
        partial: true,
    })
}

pub fn usage(message_id: &str, input_tokens: u64, output_tokens: u64) -> ScriptStep {
    ScriptStep::Message(QueryMessage::Usage {
        message_id: message_id.to_string(),
        usage: TokenUsage {
            input_tokens,
            output_tokens,
        },
    })
}

pub fn tool_use(tool_use_id: &str, name: &str, input: Value) -> ScriptStep {
    ScriptStep::Message(QueryMessage::ToolUse {
        message_id: None,
        tool_use_id: tool_use_id.to_string(),
        name: name.to_string(),
        input,
    })
}

pub fn permission(request_id: &str, tool_name: &str, input: Value) -> ScriptStep {
    ScriptStep::Message(QueryMessage::PermissionRequest(PermissionRequest {
        request_id: request_id.to_string(),
        tool_name: tool_name.to_string(),
        input,
        tool_use_id: None,
    }))
}

pub fn success(id: &str, cost_usd: f64) -> ScriptStep {
    ScriptStep::Message(QueryMessage::Result(QueryResult {
        id: Some(id.to_string()),
        subtype: "success".to_string(),
        is_error: false,
        text: Some("done".to_string()),
        cost_usd,
        num_turns: Some(1),
        usage: None,
    }))
}

pub fn budget_exceeded(id: &str, cost_usd: f64) -> ScriptStep {
    ScriptStep::Message(QueryMessage::Result(QueryResult {
        id: Some(id.to_string()),
        subtype: "error_max_budget_usd".to_string(),
        is_error: true,
        text: None,
        cost_usd,
        num_turns: Some(3),
        usage: None,
    }))
}

/// `sh` path used by the terminal tests.
pub fn shell() -> &'static Path {
    Path::new("/bin/sh")
}
