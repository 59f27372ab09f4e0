//! The session manager: owns the live session table, dispatches runs to the
//! execution backends and applies their events to session state.
//!
//! Each run is driven by one task. The task pumps the backend's event channel
//! in order, persists records on status and cost changes, publishes sanitized
//! outbound events and consults the restart supervisor when the backend
//! fails. Control calls (`respond`, `kill`, `set_mode`) only touch the run
//! through its cancellation token and input channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use futures::future::join_all;
use mission_protocol::ApprovalMode;
use mission_protocol::EventBody;
use mission_protocol::ExecutionMode;
use mission_protocol::HealthSnapshot;
use mission_protocol::JournalEntry;
use mission_protocol::JournalEntryKind;
use mission_protocol::OutboundEvent;
use mission_protocol::SessionConfig;
use mission_protocol::SessionHandle;
use mission_protocol::SessionId;
use mission_protocol::SessionRecord;
use mission_protocol::SessionStatus;
use mission_utils_string::take_bytes_at_char_boundary;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::agent::ProcessQueryClient;
use crate::agent::ProcessTaskRunner;
use crate::approval::ApprovalQueue;
use crate::backend::BackendContext;
use crate::backend::BackendError;
use crate::backend::BackendEvent;
use crate::backend::EventSink;
use crate::backend::ExecutionBackend;
use crate::backend::FailureKind;
use crate::backend::StreamingBackend;
use crate::backend::TerminalBackend;
use crate::backend::WorkerBackend;
use crate::config::ConfigError;
use crate::config::ManagerConfig;
use crate::error::SessionError;
use crate::permission::PermissionGate;
use crate::redact::SecretRedactor;
use crate::session::Session;
use crate::session::SessionSnapshot;
use crate::store::InMemorySessionStore;
use crate::store::JsonFileSessionStore;
use crate::store::SessionStore;
use crate::supervisor::RestartDecision;
use crate::supervisor::RestartPolicy;
use crate::supervisor::decide;

pub const KILLED_BY_USER: &str = "Killed by user";
pub const SERVER_SHUTDOWN: &str = "Server shutdown";

const OUTBOUND_EVENT_CAPACITY: usize = 1024;
const JOURNAL_INPUT_BYTES: usize = 500;

/// One backend per execution mode.
#[derive(Clone)]
pub struct Backends {
    pub streaming: Arc<dyn ExecutionBackend>,
    pub terminal: Arc<dyn ExecutionBackend>,
    pub worker: Arc<dyn ExecutionBackend>,
}

impl Backends {
    /// Process-backed implementations driven by the agent CLI.
    pub fn from_config(config: &ManagerConfig) -> Result<Self, ConfigError> {
        let client = Arc::new(ProcessQueryClient::new(config.streaming.clone()));
        let runner = Arc::new(ProcessTaskRunner::new(config.worker.clone()));
        Ok(Self {
            streaming: Arc::new(StreamingBackend::new(client)),
            terminal: Arc::new(TerminalBackend::new(config.terminal.clone())?),
            worker: Arc::new(WorkerBackend::new(runner, &config.worker)),
        })
    }

    fn for_mode(&self, mode: ExecutionMode) -> Arc<dyn ExecutionBackend> {
        match mode {
            ExecutionMode::Streaming => Arc::clone(&self.streaming),
            ExecutionMode::Terminal => Arc::clone(&self.terminal),
            ExecutionMode::Worker => Arc::clone(&self.worker),
        }
    }
}

/// Collaborators handed to [`SessionManager::new`].
pub struct ManagerServices {
    pub backends: Backends,
    pub approvals: Arc<dyn ApprovalQueue>,
    pub store: Arc<dyn SessionStore>,
    pub redactor: Arc<SecretRedactor>,
    pub restart: RestartPolicy,
    pub output_buffer_max_bytes: usize,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    sessions: StdMutex<HashMap<SessionId, Arc<ManagedSession>>>,
    backends: Backends,
    approvals: Arc<dyn ApprovalQueue>,
    gate: Arc<PermissionGate>,
    store: Arc<dyn SessionStore>,
    redactor: Arc<SecretRedactor>,
    events: broadcast::Sender<OutboundEvent>,
    restart: RestartPolicy,
    output_buffer_max_bytes: usize,
}

struct ManagedSession {
    id: SessionId,
    state: StdMutex<Session>,
    run: StdMutex<RunSlot>,
    approval_mode: watch::Sender<ApprovalMode>,
}

#[derive(Default)]
struct RunSlot {
    active: Option<ActiveRun>,
    next_generation: u64,
}

struct ActiveRun {
    generation: u64,
    cancel: CancellationToken,
    input: mpsc::UnboundedSender<String>,
}

/// `idle` and `complete` reported by a backend are held back until the run
/// has released its slot, so an observer that sees `idle` can follow up.
#[derive(Default)]
struct DeferredCompletion {
    idle: bool,
    complete: bool,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionManager {
    pub fn new(services: ManagerServices) -> Self {
        let (events, _) = broadcast::channel(OUTBOUND_EVENT_CAPACITY);
        let gate = Arc::new(PermissionGate::new(Arc::clone(&services.approvals)));
        Self {
            inner: Arc::new(ManagerInner {
                sessions: StdMutex::new(HashMap::new()),
                backends: services.backends,
                approvals: services.approvals,
                gate,
                store: services.store,
                redactor: services.redactor,
                events,
                restart: services.restart,
                output_buffer_max_bytes: services.output_buffer_max_bytes,
            }),
        }
    }

    /// Manager wired to the process-backed backends, the configured record
    /// store and a redactor built from the current environment.
    pub fn from_config(
        config: &ManagerConfig,
        approvals: Arc<dyn ApprovalQueue>,
    ) -> Result<Self, ConfigError> {
        let store: Arc<dyn SessionStore> = match &config.sessions.store_dir {
            Some(dir) => Arc::new(JsonFileSessionStore::new(dir.clone())),
            None => Arc::new(InMemorySessionStore::new()),
        };
        let redactor = Arc::new(SecretRedactor::from_env(&config.redaction));
        info!(secrets = redactor.secret_count(), "secret redaction initialized");
        Ok(Self::new(ManagerServices {
            backends: Backends::from_config(config)?,
            approvals,
            store,
            redactor,
            restart: RestartPolicy::from_settings(&config.restart),
            output_buffer_max_bytes: config.sessions.output_buffer_max_bytes,
        }))
    }

    /// Outbound events for every session, already sanitized.
    pub fn subscribe(&self) -> broadcast::Receiver<OutboundEvent> {
        self.inner.events.subscribe()
    }

    pub async fn spawn(&self, config: SessionConfig) -> Result<SessionHandle, SessionError> {
        validate_config(&config)?;
        let id = config.id.clone().unwrap_or_default();
        let task = config.task.clone();
        let (approval_mode, _) = watch::channel(config.approval_mode);
        let managed = Arc::new(ManagedSession {
            id: id.clone(),
            state: StdMutex::new(Session::new(
                id.clone(),
                config.clone(),
                self.inner.output_buffer_max_bytes,
            )),
            run: StdMutex::new(RunSlot::default()),
            approval_mode,
        });

        {
            let mut sessions = lock(&self.inner.sessions);
            if sessions.contains_key(&id) {
                return Err(SessionError::AlreadyExists { session_id: id });
            }
            sessions.insert(id.clone(), Arc::clone(&managed));
        }
        info!(session_id = %id, mode = %config.mode, approval_mode = %config.approval_mode, "session spawned");

        let record = {
            let mut state = lock(&managed.state);
            state.add_journal(JournalEntry::new(
                JournalEntryKind::Output,
                format!(
                    "Agent session created (mode: {}, approval: {})",
                    config.mode, config.approval_mode
                ),
            ));
            state.record()
        };
        self.persist(record).await;
        self.publish(
            &id,
            EventBody::Status {
                status: SessionStatus::Starting,
                old_status: None,
                approval_mode: Some(config.approval_mode),
            },
        );

        if task.trim().is_empty() {
            debug!(session_id = %id, "empty task, waiting for first message");
            self.transition(&managed, SessionStatus::Idle, None).await;
            return Ok(SessionHandle {
                id,
                status: SessionStatus::Idle,
            });
        }

        self.start_run(&managed, task)?;
        Ok(SessionHandle {
            id,
            status: SessionStatus::Starting,
        })
    }

    /// Route a value to the session: a pending prompt answer, raw terminal
    /// input, or a follow-up task for a finished run.
    pub async fn respond(
        &self,
        id: &SessionId,
        value: &str,
        prompt_id: Option<&str>,
    ) -> Result<(), SessionError> {
        let managed = self.session(id)?;

        if let Some(prompt_id) = prompt_id {
            return if self.inner.approvals.answer(id, Some(prompt_id), value) {
                Ok(())
            } else {
                Err(SessionError::NoPendingPrompt {
                    session_id: id.clone(),
                })
            };
        }

        let (status, mode) = {
            let state = lock(&managed.state);
            (state.status, state.config.mode)
        };

        if status == SessionStatus::WaitingForInput && self.inner.approvals.answer(id, None, value)
        {
            return Ok(());
        }

        let live_input = lock(&managed.run).active.as_ref().map(|run| run.input.clone());
        if let Some(input) = live_input {
            if mode == ExecutionMode::Terminal {
                return input.send(value.to_string()).map_err(|_| SessionError::WriteInput {
                    session_id: id.clone(),
                });
            }
            if self.inner.approvals.answer(id, None, value) {
                return Ok(());
            }
            return Err(SessionError::Busy {
                session_id: id.clone(),
            });
        }

        if !status.accepts_follow_up() {
            return Err(SessionError::NotAccepting {
                session_id: id.clone(),
                status,
            });
        }

        info!(session_id = %id, mode = %mode, "follow-up message");
        // The run reads the task and may record a new error as soon as it
        // starts, so the state is written first.
        let (previous_task, previous_error) = {
            let mut state = lock(&managed.state);
            state.add_journal(JournalEntry::new(
                JournalEntryKind::Output,
                format!("> {}", self.inner.redactor.redact(value)),
            ));
            (
                std::mem::replace(&mut state.config.task, value.to_string()),
                state.error_message.take(),
            )
        };
        if let Err(err) = self.start_run(&managed, value.to_string()) {
            let mut state = lock(&managed.state);
            state.config.task = previous_task;
            state.error_message = previous_error;
            return Err(err);
        }
        Ok(())
    }

    /// Applies to the next permission check.
    pub async fn set_mode(&self, id: &SessionId, mode: ApprovalMode) -> Result<(), SessionError> {
        let managed = self.session(id)?;
        let (status, record) = {
            let mut state = lock(&managed.state);
            state.config.approval_mode = mode;
            state.add_journal(JournalEntry::new(
                JournalEntryKind::Output,
                format!("Approval mode changed to: {mode}"),
            ));
            (state.status, state.record())
        };
        managed.approval_mode.send_replace(mode);
        info!(session_id = %id, approval_mode = %mode, "approval mode changed");
        self.publish(
            id,
            EventBody::Status {
                status,
                old_status: None,
                approval_mode: Some(mode),
            },
        );
        self.persist(record).await;
        Ok(())
    }

    /// Idempotent. The session stays queryable in `done`.
    pub async fn kill(&self, id: &SessionId) -> Result<(), SessionError> {
        let managed = self.session(id)?;
        self.stop_session(&managed, KILLED_BY_USER).await;
        Ok(())
    }

    /// Best-effort shutdown of every live session. Sessions are stopped
    /// concurrently and one slow store write does not hold up the others.
    pub async fn kill_all(&self) {
        let sessions: Vec<Arc<ManagedSession>> =
            lock(&self.inner.sessions).values().cloned().collect();
        info!(count = sessions.len(), "shutting down all sessions");
        let stops = sessions.iter().map(|managed| async move {
            let already_final = lock(&managed.state).status.is_terminal();
            if already_final {
                cancel_run(managed);
            } else {
                self.stop_session(managed, SERVER_SHUTDOWN).await;
            }
        });
        join_all(stops).await;
    }

    pub fn get_health(&self) -> HealthSnapshot {
        let sessions: Vec<Arc<ManagedSession>> =
            lock(&self.inner.sessions).values().cloned().collect();
        let mut health = HealthSnapshot {
            total: sessions.len(),
            ..HealthSnapshot::default()
        };
        for managed in sessions {
            let state = lock(&managed.state);
            match state.status {
                status if status.is_active() => health.working += 1,
                SessionStatus::Idle => health.idle += 1,
                SessionStatus::Error => health.error += 1,
                _ => {}
            }
            health.total_cost += state.cost_usd;
            health.total_restarts += u64::from(state.restart_count);
        }
        health
    }

    pub fn get_session(&self, id: &SessionId) -> Result<SessionSnapshot, SessionError> {
        let managed = self.session(id)?;
        let snapshot = lock(&managed.state).snapshot();
        Ok(snapshot)
    }

    /// Activity journal of the session, oldest entry first.
    pub fn journal(&self, id: &SessionId) -> Result<Vec<JournalEntry>, SessionError> {
        let managed = self.session(id)?;
        let entries = lock(&managed.state).journal.iter().cloned().collect();
        Ok(entries)
    }

    pub fn list_sessions(&self) -> Vec<SessionRecord> {
        let sessions: Vec<Arc<ManagedSession>> =
            lock(&self.inner.sessions).values().cloned().collect();
        let mut records: Vec<SessionRecord> = sessions
            .iter()
            .map(|managed| lock(&managed.state).record())
            .collect();
        records.sort_by_key(|record| record.created_at);
        records
    }

    /// Drop a session without a live run from the table. Its persisted
    /// record is kept.
    pub fn evict(&self, id: &SessionId) -> Result<(), SessionError> {
        let managed = self.session(id)?;
        if lock(&managed.run).active.is_some() || lock(&managed.state).status.is_active() {
            return Err(SessionError::Busy {
                session_id: id.clone(),
            });
        }
        lock(&self.inner.sessions).remove(id);
        info!(session_id = %id, "session evicted");
        Ok(())
    }

    fn session(&self, id: &SessionId) -> Result<Arc<ManagedSession>, SessionError> {
        lock(&self.inner.sessions)
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::unknown(id))
    }

    /// Claims the run slot and starts the driving task. Fails with `Busy`
    /// when a run is already active.
    fn start_run(&self, managed: &Arc<ManagedSession>, prompt: String) -> Result<(), SessionError> {
        let (generation, cancel, input_rx) = {
            let mut slot = lock(&managed.run);
            if slot.active.is_some() {
                return Err(SessionError::Busy {
                    session_id: managed.id.clone(),
                });
            }
            let generation = slot.next_generation;
            slot.next_generation += 1;
            let cancel = CancellationToken::new();
            let (input_tx, input_rx) = mpsc::unbounded_channel();
            slot.active = Some(ActiveRun {
                generation,
                cancel: cancel.clone(),
                input: input_tx,
            });
            (generation, cancel, input_rx)
        };

        let manager = self.clone();
        let managed = Arc::clone(managed);
        tokio::spawn(async move {
            manager
                .drive(managed, prompt, generation, cancel, input_rx)
                .await;
        });
        Ok(())
    }

    async fn drive(
        &self,
        managed: Arc<ManagedSession>,
        prompt: String,
        generation: u64,
        cancel: CancellationToken,
        input_rx: mpsc::UnboundedReceiver<String>,
    ) {
        let id = managed.id.clone();
        let mut input_rx = Some(input_rx);

        loop {
            let (config, conversation_id) = {
                let state = lock(&managed.state);
                (state.config.clone(), state.conversation_id.clone())
            };
            let input = match input_rx.take() {
                Some(rx) => rx,
                None => match self.replace_input(&managed, generation) {
                    Some(rx) => rx,
                    None => return,
                },
            };
            let (tx, mut rx) = mpsc::unbounded_channel();
            let sink = EventSink::new(tx, Arc::clone(&self.inner.redactor));
            let ctx = BackendContext {
                session_id: id.clone(),
                config: config.clone(),
                prompt: prompt.clone(),
                conversation_id,
                events: sink.clone(),
                input,
                approval_mode: managed.approval_mode.subscribe(),
                gate: Arc::clone(&self.inner.gate),
                cancel: cancel.clone(),
            };
            let backend = self.inner.backends.for_mode(config.mode);
            debug!(session_id = %id, mode = %config.mode, generation, "backend run starting");
            let mut handle = tokio::spawn(async move { backend.run(ctx).await });

            let mut deferred = DeferredCompletion::default();
            let joined = loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => self.apply_event(&managed, &cancel, event, &mut deferred).await,
                        None => break (&mut handle).await,
                    },
                    joined = &mut handle => break joined,
                }
            };
            // Text a backend streamed without a closing frame is still held.
            sink.flush_partial();
            drop(sink);
            while let Ok(event) = rx.try_recv() {
                self.apply_event(&managed, &cancel, event, &mut deferred).await;
            }

            let result = joined.unwrap_or_else(|err| {
                Err(BackendError::transient(format!("backend task failed: {err}")))
            });

            if cancel.is_cancelled() {
                debug!(session_id = %id, "run cancelled");
                self.release(&managed, generation);
                return;
            }

            let error = match result {
                Ok(()) => {
                    self.release(&managed, generation);
                    self.finish_ok(&managed, &cancel, &deferred).await;
                    return;
                }
                Err(error) => error,
            };

            let restart_count = lock(&managed.state).restart_count;
            match decide(&self.inner.restart, &config, restart_count, &error) {
                RestartDecision::Restart { attempt, delay } => {
                    let message = error.to_string();
                    warn!(
                        session_id = %id,
                        attempt,
                        max_restarts = config.max_restarts,
                        delay_ms = delay.as_millis() as u64,
                        error = %self.inner.redactor.redact(&message),
                        "backend failed, restarting"
                    );
                    let record = {
                        let mut state = lock(&managed.state);
                        state.restart_count = attempt;
                        state.error_message = Some(message.clone());
                        state.add_journal(JournalEntry::new(
                            JournalEntryKind::Error,
                            format!(
                                "{} (restart {attempt} of {})",
                                self.inner.redactor.redact(&message),
                                config.max_restarts
                            ),
                        ));
                        state.record()
                    };
                    self.persist(record).await;
                    self.transition(&managed, SessionStatus::Error, Some(&cancel))
                        .await;
                    self.publish(
                        &id,
                        EventBody::Error {
                            message,
                            restarting: true,
                        },
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!(session_id = %id, "killed while waiting to restart");
                            self.release(&managed, generation);
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RestartDecision::GiveUp => {
                    self.release(&managed, generation);
                    self.finish_err(&managed, &cancel, error).await;
                    return;
                }
            }
        }
    }

    /// Fresh input channel for a restarted run of the same generation.
    fn replace_input(
        &self,
        managed: &ManagedSession,
        generation: u64,
    ) -> Option<mpsc::UnboundedReceiver<String>> {
        let mut slot = lock(&managed.run);
        let run = slot.active.as_mut().filter(|run| run.generation == generation)?;
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        run.input = input_tx;
        Some(input_rx)
    }

    fn release(&self, managed: &ManagedSession, generation: u64) {
        let mut slot = lock(&managed.run);
        if slot
            .active
            .as_ref()
            .is_some_and(|run| run.generation == generation)
        {
            slot.active = None;
        }
    }

    async fn apply_event(
        &self,
        managed: &ManagedSession,
        cancel: &CancellationToken,
        event: BackendEvent,
        deferred: &mut DeferredCompletion,
    ) {
        let id = &managed.id;
        match event {
            BackendEvent::Output { text, partial } => {
                if cancel.is_cancelled() {
                    return;
                }
                lock(&managed.state).append_output(&text, partial);
                self.publish(
                    id,
                    EventBody::Output {
                        text,
                        streaming: partial,
                    },
                );
            }
            BackendEvent::ToolCall { name, input } => {
                if cancel.is_cancelled() {
                    return;
                }
                {
                    let mut state = lock(&managed.state);
                    state.record_tool_call();
                    state.add_journal(JournalEntry::new(
                        JournalEntryKind::ToolCall,
                        format!(
                            "{name}: {}",
                            take_bytes_at_char_boundary(&input.to_string(), JOURNAL_INPUT_BYTES)
                        ),
                    ));
                }
                self.publish(id, EventBody::ToolCall { tool: name, input });
            }
            BackendEvent::StatusChanged {
                status,
                conversation_id,
            } => {
                if let Some(conversation_id) = conversation_id {
                    debug!(session_id = %id, conversation_id = %conversation_id, "conversation handle captured");
                    lock(&managed.state).conversation_id = Some(conversation_id);
                }
                if cancel.is_cancelled() {
                    return;
                }
                match status {
                    SessionStatus::Idle | SessionStatus::Done => deferred.idle = true,
                    status => {
                        self.transition(managed, status, Some(cancel)).await;
                    }
                }
            }
            BackendEvent::Result {
                cost_usd,
                tokens_in,
                tokens_out,
            } => {
                let record = {
                    let mut state = lock(&managed.state);
                    state
                        .add_usage(cost_usd, tokens_in, tokens_out)
                        .then(|| state.record())
                };
                if let Some(record) = record {
                    self.persist(record).await;
                }
            }
            BackendEvent::Error { message } => {
                if cancel.is_cancelled() {
                    return;
                }
                warn!(session_id = %id, error = %message, "backend reported an error");
                self.publish(
                    id,
                    EventBody::Error {
                        message,
                        restarting: false,
                    },
                );
            }
            BackendEvent::Journal(entry) => lock(&managed.state).add_journal(entry),
            BackendEvent::Complete => deferred.complete = true,
        }
    }

    async fn finish_ok(
        &self,
        managed: &ManagedSession,
        cancel: &CancellationToken,
        deferred: &DeferredCompletion,
    ) {
        if !deferred.idle {
            debug!(session_id = %managed.id, "backend finished without reporting idle");
        }
        let applied = self
            .transition(managed, SessionStatus::Idle, Some(cancel))
            .await;
        if applied {
            let mut state = lock(&managed.state);
            let summary = format!(
                "Task completed. Cost: ${:.4}, Tools: {}",
                state.cost_usd, state.tool_calls
            );
            state.add_journal(JournalEntry::new(JournalEntryKind::Output, summary));
        }
        if applied && deferred.complete {
            self.publish(
                &managed.id,
                EventBody::Complete {
                    killed: false,
                    exit_code: None,
                    reason: None,
                },
            );
        }
    }

    async fn finish_err(
        &self,
        managed: &ManagedSession,
        cancel: &CancellationToken,
        error: BackendError,
    ) {
        let id = &managed.id;
        if error.kind() == FailureKind::Cancelled {
            info!(session_id = %id, "run cancelled upstream");
            if !self
                .transition(managed, SessionStatus::Done, Some(cancel))
                .await
            {
                return;
            }
            self.publish(
                id,
                EventBody::Complete {
                    killed: true,
                    exit_code: None,
                    reason: Some(KILLED_BY_USER.to_string()),
                },
            );
            return;
        }

        let message = error.to_string();
        warn!(session_id = %id, error = %self.inner.redactor.redact(&message), "session failed");
        if !self
            .transition_with(managed, SessionStatus::Error, Some(cancel), Some(&message))
            .await
        {
            return;
        }
        lock(&managed.state).add_journal(JournalEntry::new(
            JournalEntryKind::Error,
            self.inner.redactor.redact(&message),
        ));
        self.publish(
            id,
            EventBody::Error {
                message: message.clone(),
                restarting: false,
            },
        );
        let exit_code = match error {
            BackendError::Exited { code } => Some(code),
            _ => None,
        };
        self.publish(
            id,
            EventBody::Complete {
                killed: false,
                exit_code,
                reason: Some(message),
            },
        );
    }

    async fn stop_session(&self, managed: &ManagedSession, reason: &str) {
        let id = &managed.id;
        cancel_run(managed);
        self.inner.approvals.cancel_session(id);

        let changed = {
            let mut state = lock(&managed.state);
            if state.status == SessionStatus::Done {
                None
            } else {
                state.error_message = Some(reason.to_string());
                state.add_journal(JournalEntry::new(
                    JournalEntryKind::Output,
                    format!("Agent session stopped: {reason}"),
                ));
                let old = state.set_status(SessionStatus::Done);
                Some((old, state.record()))
            }
        };
        let Some((old_status, record)) = changed else {
            debug!(session_id = %id, "session already stopped");
            return;
        };

        info!(session_id = %id, reason, "session stopped");
        if old_status.is_some() {
            self.publish(
                id,
                EventBody::Status {
                    status: SessionStatus::Done,
                    old_status,
                    approval_mode: None,
                },
            );
        }
        self.publish(
            id,
            EventBody::Complete {
                killed: true,
                exit_code: None,
                reason: Some(reason.to_string()),
            },
        );
        self.persist(record).await;
    }

    /// Status change with its event and record upsert. A run's own
    /// transitions pass its token and are dropped once the run is cancelled;
    /// `kill` cancels before it takes the state lock.
    async fn transition(
        &self,
        managed: &ManagedSession,
        status: SessionStatus,
        cancel: Option<&CancellationToken>,
    ) -> bool {
        self.transition_with(managed, status, cancel, None).await
    }

    async fn transition_with(
        &self,
        managed: &ManagedSession,
        status: SessionStatus,
        cancel: Option<&CancellationToken>,
        error_message: Option<&str>,
    ) -> bool {
        let changed = {
            let mut state = lock(&managed.state);
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return false;
            }
            if let Some(message) = error_message {
                state.error_message = Some(message.to_string());
            }
            state
                .set_status(status)
                .map(|old_status| (old_status, state.record()))
        };
        let Some((old_status, record)) = changed else {
            return true;
        };
        debug!(session_id = %managed.id, old_status = %old_status, status = %status, "status changed");
        self.publish(
            &managed.id,
            EventBody::Status {
                status,
                old_status: Some(old_status),
                approval_mode: None,
            },
        );
        self.persist(record).await;
        true
    }

    async fn persist(&self, record: SessionRecord) {
        if let Err(err) = self.inner.store.upsert(&record).await {
            warn!(session_id = %record.id, error = %err, "failed to persist session record");
        }
    }

    fn publish(&self, session_id: &SessionId, body: EventBody) {
        let event = OutboundEvent::new(session_id.clone(), sanitize_body(&self.inner.redactor, body));
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}

fn cancel_run(managed: &ManagedSession) {
    if let Some(run) = lock(&managed.run).active.as_ref() {
        run.cancel.cancel();
    }
}

fn validate_config(config: &SessionConfig) -> Result<(), SessionError> {
    if config.cwd.as_os_str().is_empty() {
        return Err(SessionError::MissingCwd);
    }
    if let Some(budget) = config.max_budget_usd
        && !(budget.is_finite() && budget > 0.0)
    {
        return Err(SessionError::invalid_config(format!(
            "maxBudgetUsd must be positive, got {budget}"
        )));
    }
    if config.max_turns == Some(0) {
        return Err(SessionError::invalid_config("maxTurns must be at least 1"));
    }
    Ok(())
}

/// Last stage before an event leaves the process: every free-text field is
/// masked and stripped of executable markup.
pub(crate) fn sanitize_body(redactor: &SecretRedactor, body: EventBody) -> EventBody {
    match body {
        EventBody::Output { text, streaming } => EventBody::Output {
            text: redactor.redact(&text),
            streaming,
        },
        EventBody::ToolCall { tool, input } => EventBody::ToolCall {
            tool: redactor.redact(&tool),
            input: redactor.redact_json(&input),
        },
        EventBody::Error {
            message,
            restarting,
        } => EventBody::Error {
            message: redactor.redact(&message),
            restarting,
        },
        EventBody::Complete {
            killed,
            exit_code,
            reason,
        } => EventBody::Complete {
            killed,
            exit_code,
            reason: reason.map(|reason| redactor.redact(&reason)),
        },
        status @ EventBody::Status { .. } => status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn sanitize_masks_every_text_field() {
        let redactor = SecretRedactor::new(["sk-live-123456"], 8);

        let output = sanitize_body(
            &redactor,
            EventBody::Output {
                text: "key sk-live-123456<script>alert(1)</script>".to_string(),
                streaming: true,
            },
        );
        assert_eq!(
            output,
            EventBody::Output {
                text: "key ***".to_string(),
                streaming: true
            }
        );

        let tool = sanitize_body(
            &redactor,
            EventBody::ToolCall {
                tool: "Bash".to_string(),
                input: json!({"command": "curl -H 'x: sk-live-123456'"}),
            },
        );
        assert_eq!(
            tool,
            EventBody::ToolCall {
                tool: "Bash".to_string(),
                input: json!({"command": "curl -H 'x: ***'"}),
            }
        );

        let complete = sanitize_body(
            &redactor,
            EventBody::Complete {
                killed: false,
                exit_code: Some(1),
                reason: Some("failed with sk-live-123456".to_string()),
            },
        );
        assert_eq!(
            complete,
            EventBody::Complete {
                killed: false,
                exit_code: Some(1),
                reason: Some("failed with ***".to_string()),
            }
        );
    }

    #[test]
    fn config_validation() {
        let mut config = SessionConfig::new(ExecutionMode::Streaming, "", "task");
        assert!(matches!(
            validate_config(&config),
            Err(SessionError::MissingCwd)
        ));

        config.cwd = "/work".into();
        assert!(validate_config(&config).is_ok());

        config.max_budget_usd = Some(-1.0);
        assert!(matches!(
            validate_config(&config),
            Err(SessionError::InvalidConfig { .. })
        ));

        config.max_budget_usd = Some(1.0);
        config.max_turns = Some(0);
        assert!(matches!(
            validate_config(&config),
            Err(SessionError::InvalidConfig { .. })
        ));
    }
}
