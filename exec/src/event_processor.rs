use mission_core::PromptRequest;
use mission_protocol::EventBody;
use mission_protocol::OutboundEvent;
use mission_protocol::SessionId;
use mission_protocol::SessionRecord;
use mission_protocol::SessionStatus;

/// Whether the run loop should keep reading events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Finished { exit_code: i32 },
}

pub trait EventProcessor {
    /// Handle one event for the watched session.
    fn process_event(&mut self, event: &OutboundEvent) -> ProcessStatus;

    /// A permission question is waiting for an answer on stdin.
    fn print_prompt(&mut self, request: &PromptRequest);

    fn print_summary(&mut self, record: &SessionRecord);
}

/// Exit code once the run is over: the child's own code when it reported
/// one, 1 for failures and kills, 0 otherwise. A run that settles into
/// `idle` finished its task.
pub fn exit_code_for(body: &EventBody, failed: bool) -> Option<i32> {
    match body {
        EventBody::Status {
            status: SessionStatus::Idle,
            old_status: Some(_),
            ..
        } => Some(0),
        EventBody::Complete {
            exit_code: Some(code),
            ..
        } => Some(*code),
        EventBody::Complete { killed: true, .. } => Some(1),
        EventBody::Complete { .. } => Some(i32::from(failed)),
        _ => None,
    }
}

pub struct HumanOutput {
    session_id: SessionId,
    saw_error: bool,
    mid_line: bool,
}

impl HumanOutput {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            saw_error: false,
            mid_line: false,
        }
    }

    fn end_line(&mut self) {
        if self.mid_line {
            println!();
            self.mid_line = false;
        }
    }
}

impl EventProcessor for HumanOutput {
    fn process_event(&mut self, event: &OutboundEvent) -> ProcessStatus {
        if event.session_id != self.session_id {
            return ProcessStatus::Running;
        }
        match &event.body {
            EventBody::Output { text, streaming } => {
                print!("{text}");
                self.mid_line = *streaming && !text.ends_with('\n');
            }
            EventBody::Status {
                status, old_status, ..
            } => {
                self.end_line();
                match old_status {
                    Some(old) => eprintln!("[status] {old} -> {status}"),
                    None => eprintln!("[status] {status}"),
                }
                if let Some(exit_code) = exit_code_for(&event.body, self.saw_error) {
                    return ProcessStatus::Finished { exit_code };
                }
            }
            EventBody::ToolCall { tool, input } => {
                self.end_line();
                eprintln!("[tool] {tool} {input}");
            }
            EventBody::Error {
                message,
                restarting,
            } => {
                self.end_line();
                self.saw_error = !restarting;
                if *restarting {
                    eprintln!("[error] {message} (restarting)");
                } else {
                    eprintln!("[error] {message}");
                }
            }
            EventBody::Complete { reason, .. } => {
                self.end_line();
                if let Some(reason) = reason {
                    eprintln!("[complete] {reason}");
                }
                let exit_code = exit_code_for(&event.body, self.saw_error).unwrap_or(0);
                return ProcessStatus::Finished { exit_code };
            }
        }
        ProcessStatus::Running
    }

    fn print_prompt(&mut self, request: &PromptRequest) {
        self.end_line();
        eprintln!("[prompt {}] {}", request.id, request.question);
        if !request.options.is_empty() {
            eprintln!("  options: {}", request.options.join(" / "));
        }
    }

    fn print_summary(&mut self, record: &SessionRecord) {
        self.end_line();
        eprintln!(
            "session {} finished as {}: cost ${:.4}, tokens {} in / {} out, {} tool calls, {} restarts",
            record.id,
            record.status,
            record.cost,
            record.tokens_in,
            record.tokens_out,
            record.tool_calls,
            record.restart_count,
        );
    }
}

/// One JSON object per line on stdout, in the outbound event wire shape.
pub struct JsonlOutput {
    session_id: SessionId,
    saw_error: bool,
}

impl JsonlOutput {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            saw_error: false,
        }
    }

    fn emit<T: serde::Serialize>(value: &T) {
        match serde_json::to_string(value) {
            Ok(line) => println!("{line}"),
            Err(err) => tracing::error!("failed to serialize event: {err}"),
        }
    }
}

impl EventProcessor for JsonlOutput {
    fn process_event(&mut self, event: &OutboundEvent) -> ProcessStatus {
        if event.session_id != self.session_id {
            return ProcessStatus::Running;
        }
        Self::emit(event);
        if let EventBody::Error { restarting, .. } = &event.body {
            self.saw_error = !restarting;
        }
        match exit_code_for(&event.body, self.saw_error) {
            Some(exit_code) => ProcessStatus::Finished { exit_code },
            None => ProcessStatus::Running,
        }
    }

    fn print_prompt(&mut self, request: &PromptRequest) {
        Self::emit(&serde_json::json!({
            "sessionId": request.session_id,
            "type": "prompt",
            "payload": {
                "promptId": request.id,
                "question": request.question,
                "options": request.options,
            },
        }));
    }

    fn print_summary(&mut self, record: &SessionRecord) {
        Self::emit(&serde_json::json!({
            "sessionId": record.id,
            "type": "summary",
            "payload": record,
        }));
    }
}
