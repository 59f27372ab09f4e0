use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use mission_protocol::ApprovalMode;
use mission_protocol::JournalEntryKind;
use mission_protocol::SessionStatus;
use portable_pty::ChildKiller;
use portable_pty::CommandBuilder;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::BackendContext;
use super::BackendError;
use super::EventSink;
use super::ExecutionBackend;
use super::streaming::StreamLedger;
use super::streaming::result_failure;
use crate::agent::Frame;
use crate::agent::JsonLineDecoder;
use crate::agent::StreamInterpreter;
use crate::config::ConfigError;
use crate::config::TerminalSettings;
use crate::terminal_text::AnsiStripper;
use crate::terminal_text::DetectionBuffer;
use crate::terminal_text::PromptDetector;
use crate::terminal_text::decode_utf8_chunk;

const READ_BUFFER_BYTES: usize = 8192;
const OUTPUT_CHANNEL_CAPACITY: usize = 256;
const WRITER_CHANNEL_CAPACITY: usize = 128;
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);
const AUTO_APPROVE_COOLDOWN: Duration = Duration::from_millis(1_000);

/// Drives an interactive CLI through a pseudo-terminal.
pub struct TerminalBackend {
    settings: TerminalSettings,
    detector: PromptDetector,
}

impl TerminalBackend {
    pub fn new(settings: TerminalSettings) -> Result<Self, ConfigError> {
        let detector = PromptDetector::new(settings.compile_patterns()?);
        Ok(Self { settings, detector })
    }

    /// Arguments for one run, and whether the task has to be typed in once
    /// the ready prompt appears.
    fn command_args(&self, prompt: &str, conversation_id: Option<&str>) -> (Vec<String>, bool) {
        let inline_task = self.settings.args.iter().any(|arg| arg.contains("{task}"));
        let mut args: Vec<String> = self
            .settings
            .args
            .iter()
            .map(|arg| arg.replace("{task}", prompt))
            .collect();
        if let Some(conversation_id) = conversation_id {
            args.extend(
                self.settings
                    .resume_args
                    .iter()
                    .map(|arg| arg.replace("{conversation_id}", conversation_id)),
            );
        }
        (args, !inline_task)
    }
}

/// A child attached to a pty. The child is killed when this is dropped.
struct PtyProcess {
    writer_tx: mpsc::Sender<Vec<u8>>,
    output_rx: mpsc::Receiver<Vec<u8>>,
    exit_rx: oneshot::Receiver<i32>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    writer_handle: JoinHandle<()>,
}

impl PtyProcess {
    async fn write(&self, text: &str) -> Result<(), BackendError> {
        self.writer_tx
            .send(text.as_bytes().to_vec())
            .await
            .map_err(|_| BackendError::transient("terminal input closed"))
    }

    fn kill(&mut self) {
        if let Err(err) = self.killer.kill() {
            tracing::trace!(error = %err, "terminal child already exited");
        }
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.kill();
        self.writer_handle.abort();
    }
}

fn spawn_pty(settings: &TerminalSettings, cwd: &Path, args: &[String]) -> anyhow::Result<PtyProcess> {
    let pty_system = native_pty_system();
    let pair = pty_system.openpty(PtySize {
        rows: settings.rows,
        cols: settings.cols,
        pixel_width: 0,
        pixel_height: 0,
    })?;

    let mut command_builder = CommandBuilder::new(&settings.program);
    command_builder.args(args);
    command_builder.cwd(cwd);
    command_builder.env("TERM", "xterm-256color");
    command_builder.env("COLORTERM", "truecolor");

    let mut child = pair.slave.spawn_command(command_builder)?;
    let killer = child.clone_killer();

    let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(WRITER_CHANNEL_CAPACITY);
    let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(OUTPUT_CHANNEL_CAPACITY);

    let mut reader = pair.master.try_clone_reader()?;
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_BUFFER_BYTES];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                    continue;
                }
                Err(_) => break,
            }
        }
    });

    let writer = pair.master.take_writer()?;
    let writer = Arc::new(StdMutex::new(writer));
    let writer_handle = tokio::spawn(async move {
        while let Some(bytes) = writer_rx.recv().await {
            let writer = Arc::clone(&writer);
            let _ = tokio::task::spawn_blocking(move || {
                if let Ok(mut guard) = writer.lock() {
                    let _ = guard.write_all(&bytes);
                    let _ = guard.flush();
                }
            })
            .await;
        }
    });

    let (exit_tx, exit_rx) = oneshot::channel::<i32>();
    tokio::task::spawn_blocking(move || {
        let code = match child.wait() {
            Ok(status) => status.exit_code() as i32,
            Err(_) => -1,
        };
        let _ = exit_tx.send(code);
    });

    Ok(PtyProcess {
        writer_tx,
        output_rx,
        exit_rx,
        killer,
        writer_handle,
    })
}

/// Output-side state of one terminal run.
struct TerminalReader {
    events: EventSink,
    pending_utf8: Vec<u8>,
    ansi: AnsiStripper,
    decoder: JsonLineDecoder,
    interpreter: StreamInterpreter,
    ledger: StreamLedger,
    detection: DetectionBuffer,
    failure: Option<BackendError>,
}

impl TerminalReader {
    fn new(events: EventSink) -> Self {
        Self {
            events,
            pending_utf8: Vec::new(),
            ansi: AnsiStripper::default(),
            decoder: JsonLineDecoder::with_partial_text(),
            interpreter: StreamInterpreter::new(),
            ledger: StreamLedger::default(),
            detection: DetectionBuffer::default(),
            failure: None,
        }
    }

    fn ingest(&mut self, bytes: &[u8]) {
        let text = self
            .ansi
            .push(&decode_utf8_chunk(&mut self.pending_utf8, bytes));
        self.accept(&text);
    }

    fn accept(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.detection.push(text);
        let frames = self.decoder.push(text);
        self.forward(frames);
    }

    fn finish(&mut self) {
        let tail = self.ansi.finish();
        self.accept(&tail);
        let frames = self.decoder.finish();
        self.forward(frames);
    }

    fn forward(&mut self, frames: Vec<Frame>) {
        for frame in frames {
            match frame {
                Frame::Text { text, partial } => self.events.output(&text, partial),
                Frame::Json(value) => {
                    for message in self.interpreter.interpret(&value) {
                        if let Some(result) = self.ledger.forward(&self.events, message) {
                            self.failure = result_failure(&result);
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ExecutionBackend for TerminalBackend {
    async fn run(&self, ctx: BackendContext) -> Result<(), BackendError> {
        let BackendContext {
            session_id,
            config,
            prompt,
            conversation_id,
            events,
            mut input,
            approval_mode,
            cancel,
            ..
        } = ctx;
        events.status(SessionStatus::Working);

        let (args, inject) = self.command_args(&prompt, conversation_id.as_deref());
        let mut process =
            spawn_pty(&self.settings, &config.cwd, &args).map_err(BackendError::spawn)?;
        tracing::info!(session_id = %session_id, program = %self.settings.program, "terminal started");

        let mut pending_task = Some(prompt).filter(|task| inject && !task.trim().is_empty());
        let mut reader = TerminalReader::new(events.clone());
        let mut last_auto_approval: Option<Instant> = None;

        let exit_code = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    process.kill();
                    return Err(BackendError::Cancelled);
                }
                chunk = process.output_rx.recv() => {
                    let Some(bytes) = chunk else {
                        // Output closed; the exit status follows.
                        break (&mut process.exit_rx).await.unwrap_or(-1);
                    };
                    reader.ingest(&bytes);

                    if let Some(task) = pending_task.take_if(|_| self.detector.is_ready(reader.detection.as_str())) {
                        tracing::debug!(session_id = %session_id, "ready prompt detected; sending task");
                        reader.detection.clear();
                        process.write(&format!("{task}\r")).await?;
                    }

                    let cooled_down = last_auto_approval
                        .is_none_or(|at| at.elapsed() >= AUTO_APPROVE_COOLDOWN);
                    if cooled_down
                        && *approval_mode.borrow() == ApprovalMode::Auto
                        && self.detector.is_confirmation(reader.detection.as_str())
                    {
                        let question = reader.detection.last_line().to_string();
                        reader.detection.clear();
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                process.kill();
                                return Err(BackendError::Cancelled);
                            }
                            _ = tokio::time::sleep(self.settings.auto_approve_delay()) => {}
                        }
                        process
                            .write(&format!("{}\r", self.settings.affirmative_response))
                            .await?;
                        last_auto_approval = Some(Instant::now());
                        events.output(
                            &format!("{} {question}", self.settings.auto_approve_marker),
                            false,
                        );
                        events.journal(
                            JournalEntryKind::AutoApproved,
                            &format!("Auto-approved: {question}"),
                            json!({ "reason": "confirmation prompt" }),
                        );
                    }
                }
                Some(value) = input.recv() => {
                    process.write(&format!("{value}\r")).await?;
                }
                code = &mut process.exit_rx => {
                    // Pick up whatever the reader still has buffered.
                    while let Ok(Some(bytes)) =
                        tokio::time::timeout(EXIT_DRAIN_TIMEOUT, process.output_rx.recv()).await
                    {
                        reader.ingest(&bytes);
                    }
                    break code.unwrap_or(-1);
                }
            }
        };
        reader.finish();
        tracing::info!(session_id = %session_id, exit_code, "terminal exited");

        if exit_code == 0 {
            events.status(SessionStatus::Idle);
            events.complete();
            return Ok(());
        }
        match reader.failure.take() {
            Some(failure @ BackendError::BudgetExhausted { .. }) => Err(failure),
            _ => Err(BackendError::Exited { code: exit_code }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendEvent;
    use crate::redact::SecretRedactor;
    use pretty_assertions::assert_eq;

    fn backend(args: &[&str]) -> TerminalBackend {
        TerminalBackend::new(TerminalSettings {
            args: args.iter().map(|a| (*a).to_string()).collect(),
            ..TerminalSettings::default()
        })
        .unwrap()
    }

    #[test]
    fn task_placeholder_disables_injection() {
        let (args, inject) = backend(&["-p", "{task}"]).command_args("fix it", None);
        assert_eq!(args, vec!["-p".to_string(), "fix it".to_string()]);
        assert!(!inject);
    }

    #[test]
    fn reader_strips_an_escape_split_across_reads() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let events = EventSink::new(tx, Arc::new(SecretRedactor::default()));
        let mut reader = TerminalReader::new(events.clone());

        reader.ingest(b"hello \x1b[3");
        reader.ingest(b"1mworld\n");
        reader.finish();
        events.flush_partial();

        let mut seen = String::new();
        while let Ok(event) = rx.try_recv() {
            if let BackendEvent::Output { text, .. } = event {
                seen.push_str(&text);
            }
        }
        assert_eq!(seen, "hello world");
    }

    #[test]
    fn resume_arguments_follow_the_conversation() {
        let (args, inject) = backend(&[]).command_args("next step", Some("conv-7"));
        assert_eq!(args, vec!["--resume".to_string(), "conv-7".to_string()]);
        assert!(inject);
    }
}
