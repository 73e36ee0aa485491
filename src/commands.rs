use crate::models::Conversation;
use crate::session::TurnOutcome;
use crate::state::AppState;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "chatsync", version, about = "Local-first chat client with push-stream replies")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List conversations, most recently updated first
    Conversations,
    /// Start a conversation
    New {
        #[arg(default_value = "New Chat")]
        title: String,
    },
    /// Print the latest page of a conversation
    History { conversation_id: String },
    /// Send a message and print the reply as it streams in
    Send { conversation_id: String, text: String },
    /// Replay messages that have not reached the server yet
    Sync {
        /// Keep syncing on CHATSYNC_SYNC_INTERVAL_SECS until interrupted
        #[arg(long)]
        watch: bool,
    },
    /// Delete a conversation and its messages
    Delete { conversation_id: String },
}

pub async fn execute(state: &AppState, command: Command) -> Result<()> {
    match command {
        Command::Conversations => list_conversations(state).await,
        Command::New { title } => create_conversation(state, &title).await,
        Command::History { conversation_id } => show_history(state, &conversation_id).await,
        Command::Send {
            conversation_id,
            text,
        } => send_message(state, &conversation_id, &text).await,
        Command::Sync { watch: false } => sync_pending(state).await,
        Command::Sync { watch: true } => watch_sync(state).await,
        Command::Delete { conversation_id } => delete_conversation(state, &conversation_id).await,
    }
}

fn print_conversation(conv: &Conversation) {
    let marker = if conv.synced { " " } else { "*" };
    println!(
        "{}{}  {}  ({} messages, updated {})",
        marker,
        conv.id,
        conv.title,
        conv.message_count,
        conv.updated_at.format("%Y-%m-%d %H:%M")
    );
}

async fn list_conversations(state: &AppState) -> Result<()> {
    log::info!("Listing conversations for {}", state.config.user_id);
    let conversations = state.session.conversations().await?;
    if conversations.is_empty() {
        println!("No conversations yet.");
    }
    for conv in &conversations {
        print_conversation(conv);
    }
    Ok(())
}

async fn create_conversation(state: &AppState, title: &str) -> Result<()> {
    if title.trim().is_empty() {
        return Err(anyhow::anyhow!("Title cannot be empty."));
    }
    let conv = state.session.start_conversation(title.trim()).await?;
    print_conversation(&conv);
    Ok(())
}

async fn show_history(state: &AppState, conversation_id: &str) -> Result<()> {
    for message in state.session.history(conversation_id).await? {
        let marker = if message.synced { " " } else { "*" };
        println!("{}[{}] {}", marker, message.role, message.content);
    }
    Ok(())
}

async fn send_message(state: &AppState, conversation_id: &str, text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(anyhow::anyhow!("Message cannot be empty."));
    }

    // Echo partial text as it grows
    let mut status = state.session.subscribe();
    let echoed = Arc::new(AtomicUsize::new(0));
    let printer = {
        let echoed = echoed.clone();
        tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let partial = status.borrow_and_update().partial.clone();
                // Cleared on reconnect and at the end of the turn
                if partial.is_empty() {
                    continue;
                }
                let printed = echoed.load(Ordering::SeqCst);
                if partial.len() > printed && partial.is_char_boundary(printed) {
                    print!("{}", &partial[printed..]);
                    let _ = std::io::stdout().flush();
                }
                echoed.store(partial.len(), Ordering::SeqCst);
            }
        })
    };

    let outcome = state.session.send_message(conversation_id, text).await;
    printer.abort();
    let _ = printer.await;

    match outcome? {
        TurnOutcome::Completed(message) => {
            println!("{}", unprinted_tail(&message.content, echoed.load(Ordering::SeqCst)));
            log::info!("Assistant replied with message {}", message.local_id);
        }
        TurnOutcome::Queued(message) => {
            println!();
            println!("Offline: message {} will be sent on the next sync.", message.local_id);
        }
        TurnOutcome::Failed(reason) => {
            println!();
            return Err(anyhow::anyhow!("Stream error: {}", reason));
        }
        TurnOutcome::TimedOut => {
            println!();
            let reason = state.session.status().error.unwrap_or_default();
            return Err(anyhow::anyhow!("{}", reason));
        }
        TurnOutcome::Stopped => println!("\nStopped."),
    }
    Ok(())
}

/// The part of a reply the live echo has not shown yet. A reply that
/// arrived in one piece was never echoed at all.
fn unprinted_tail(content: &str, echoed: usize) -> &str {
    content.get(echoed..).unwrap_or(content)
}

async fn sync_pending(state: &AppState) -> Result<()> {
    let report = state.session.sync_pending().await?;
    println!(
        "Synced {} of {} messages ({} failed), {} conversations created.",
        report.synced, report.attempted, report.failed, report.conversations_synced
    );
    if !report.is_clean() {
        return Err(anyhow::anyhow!("{} messages are still waiting", report.failed));
    }
    Ok(())
}

async fn watch_sync(state: &AppState) -> Result<()> {
    let interval = state
        .config
        .sync_interval
        .ok_or_else(|| anyhow::anyhow!("CHATSYNC_SYNC_INTERVAL_SECS is not set"))?;
    log::info!("Syncing every {:?}", interval);
    let handle = state.session.spawn_periodic_sync(interval);
    tokio::signal::ctrl_c().await?;
    handle.abort();
    state.session.registry().close_all();
    Ok(())
}

async fn delete_conversation(state: &AppState, conversation_id: &str) -> Result<()> {
    log::warn!("Deleting conversation {}", conversation_id);
    state.session.delete_conversation(conversation_id).await?;
    println!("Deleted {}", conversation_id);
    Ok(())
}
