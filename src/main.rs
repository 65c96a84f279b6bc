//! Terminal chat front end
//!
//! Ctrl-C stops the reply being generated or abandons a model download;
//! end of input exits and releases the model.

use std::io::Write;

use offline_assistant::inference::{
    ConversationContext, GenerationEvent, GenerationOutcome, GenerateError,
};
use offline_assistant::lifecycle::LifecycleSignal;
use offline_assistant::storage::conversations::Conversation;
use offline_assistant::storage::download::format_size;
use offline_assistant::storage::StorageError;
use offline_assistant::types::Turn;
use offline_assistant::{AppError, AssistantCore};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let core = AssistantCore::init()?;

    if core.settings().auto_load_model {
        prepare(&core).await;
    }
    println!("Type a message. Ctrl-C stops a reply, Ctrl-D quits.");

    let mut context = ConversationContext::new();
    let mut conversation = Conversation::new("");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        let _ = std::io::stdout().flush();

        let line = tokio::select! {
            line = lines.next_line() => line.map_err(StorageError::from)?,
            _ = tokio::signal::ctrl_c() => {
                core.handle_lifecycle(LifecycleSignal::Backgrounded).await;
                println!();
                continue;
            }
        };
        let Some(line) = line else { break };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        let mut stream = match core.controller().generate(&mut context, Turn::user(input)) {
            Ok(stream) => stream,
            Err(GenerateError::NotReady(state)) => {
                println!("[model is {state}, loading it; send the message again]");
                prepare(&core).await;
                continue;
            }
            Err(e) => {
                println!("[{e}]");
                continue;
            }
        };
        conversation.turns.push(Turn::user(input));

        let mut reply = String::new();
        let outcome = loop {
            tokio::select! {
                event = stream.recv() => match event {
                    Some(GenerationEvent::Fragment(fragment)) => {
                        print!("{fragment}");
                        let _ = std::io::stdout().flush();
                        reply.push_str(&fragment);
                    }
                    Some(GenerationEvent::Finished(outcome)) => break outcome,
                    None => break GenerationOutcome::Cancelled { fragments: 0 },
                },
                _ = tokio::signal::ctrl_c() => {
                    core.handle_lifecycle(LifecycleSignal::Backgrounded).await;
                }
            }
        };
        println!();

        match outcome {
            GenerationOutcome::Completed { .. } => {}
            GenerationOutcome::Cancelled { .. } => println!("[stopped]"),
            GenerationOutcome::Failed(e) => {
                println!("[{e}]");
                if e.is_unrecoverable() {
                    prepare(&core).await;
                }
            }
        }

        if reply.is_empty() {
            context.discard_pending();
        } else {
            context.push_assistant(reply.clone());
            conversation.turns.push(Turn::assistant(reply));
        }

        if let Err(e) = core.conversations().save(&mut conversation) {
            tracing::warn!("Failed to save conversation: {}", e);
        }
    }

    core.shutdown().await;
    Ok(())
}

/// Download and load the model. Failures are reported and the chat goes
/// on; Ctrl-C abandons the download.
async fn prepare(core: &AssistantCore) {
    let result = tokio::select! {
        result = core.prepare_model(print_progress) => result,
        _ = tokio::signal::ctrl_c() => {
            core.assets().cancel();
            println!();
            println!("[model preparation cancelled; send a message to retry]");
            return;
        }
    };
    println!();

    match result {
        Ok(info) => println!("Model ready: {} ({})", info.path, format_size(info.size_bytes)),
        Err(e) => {
            tracing::warn!("Model preparation failed: {}", e);
            println!("[{e}; send a message to retry]");
        }
    }
}

fn print_progress(received: u64, total: Option<u64>) {
    match total {
        Some(total) if total > 0 => print!(
            "\rDownloading model: {} / {} ({:.0}%)",
            format_size(received),
            format_size(total),
            received as f64 / total as f64 * 100.0
        ),
        _ => print!("\rDownloading model: {}", format_size(received)),
    }
    let _ = std::io::stdout().flush();
}
