//! Headless driver: spawns one session, streams its events to stdout and
//! forwards stdin lines back into the session as prompt answers or input.

mod cli;
mod event_processor;

use std::sync::Arc;

use anyhow::Context;
use mission_core::ManagerConfig;
use mission_core::PromptQueue;
use mission_core::SessionManager;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::warn;
use tracing_subscriber::EnvFilter;

pub use cli::ApprovalArg;
pub use cli::Cli;
pub use cli::ModeArg;
use event_processor::EventProcessor;
use event_processor::HumanOutput;
use event_processor::JsonlOutput;
use event_processor::ProcessStatus;

/// Conventional exit code after SIGINT.
const INTERRUPTED_EXIT_CODE: i32 = 130;

pub async fn run_main(cli: Cli) -> anyhow::Result<i32> {
    setup_tracing();

    let config = ManagerConfig::load(cli.home.as_deref()).context("failed to load config")?;
    let prompts = Arc::new(PromptQueue::new());
    let manager = SessionManager::from_config(&config, prompts.clone())
        .context("failed to build session manager")?;

    let task = match cli.prompt.as_deref() {
        Some("-") => read_task_from_stdin().await?,
        Some(prompt) => prompt.to_string(),
        None => String::new(),
    };
    if task.trim().is_empty() {
        anyhow::bail!("no task given; pass a prompt or `-` to read it from stdin");
    }
    let cwd = match &cli.cwd {
        Some(cwd) => cwd.clone(),
        None => std::env::current_dir().context("failed to read current directory")?,
    };

    // Subscribe before spawning so the first status event is not missed.
    let mut events = manager.subscribe();
    let mut announcements = prompts.subscribe();
    let handle = manager.spawn(cli.session_config(task, cwd)).await?;
    let session_id = handle.id;

    let mut processor: Box<dyn EventProcessor> = if cli.json {
        Box::new(JsonlOutput::new(session_id.clone()))
    } else {
        Box::new(HumanOutput::new(session_id.clone()))
    };

    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line_tx.send(line).is_err() {
                break;
            }
        }
        debug!("stdin closed");
    });

    let exit_code = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                manager.kill_all().await;
                break INTERRUPTED_EXIT_CODE;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if let ProcessStatus::Finished { exit_code } = processor.process_event(&event) {
                        break exit_code;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => break 1,
            },
            request = announcements.recv() => {
                if let Ok(request) = request
                    && request.session_id == session_id
                {
                    processor.print_prompt(&request);
                }
            }
            Some(line) = line_rx.recv() => {
                if let Err(err) = manager.respond(&session_id, &line, None).await {
                    warn!("input not delivered: {err}");
                }
            }
        }
    };

    if let Ok(snapshot) = manager.get_session(&session_id) {
        processor.print_summary(&snapshot.record);
    }
    manager.kill_all().await;
    Ok(exit_code)
}

async fn read_task_from_stdin() -> anyhow::Result<String> {
    use tokio::io::AsyncReadExt;

    let mut task = String::new();
    tokio::io::stdin()
        .read_to_string(&mut task)
        .await
        .context("failed to read task from stdin")?;
    Ok(task)
}

fn setup_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
