mod context;
mod render;
mod repl;
mod storage;
mod sync;

use std::path::PathBuf;
use std::time::Duration;

use chatloom_core::{SendOptions, SyncService, build_message_tree};
use clap::{Parser, Subcommand};
use context::Context;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chatloom", about = "Branching chat conversations in the terminal")]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Chat backend URL (overrides CHATLOOM_BASE_URL and config.yaml).
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Ollama server URL for `ollama/` models.
    #[arg(long, global = true)]
    ollama_url: Option<String>,

    /// Model for new conversations and messages.
    #[arg(long, short, global = true)]
    model: Option<String>,

    /// Cache database path. Defaults to the user data directory.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive chat (default).
    Chat {
        /// Continue this conversation instead of starting a new one.
        conversation: Option<String>,
    },
    /// Send one message and print the reply.
    Send {
        message: String,
        #[arg(long, short)]
        conversation: Option<String>,
    },
    /// List cached conversations.
    List,
    /// Replay queued writes and pull conversations with their messages.
    Sync,
    /// Print a conversation's message tree.
    Tree { conversation: String },
    /// Show interrupted generations and prune finished records.
    Streams {
        /// Drop finished records older than this many hours.
        #[arg(long, default_value_t = 24)]
        prune_hours: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut ctx = Context::open(&cli).await?;

    match &cli.command {
        None => repl::run(&mut ctx, None).await?,
        Some(Command::Chat { conversation }) => repl::run(&mut ctx, conversation.as_deref()).await?,
        Some(Command::Send {
            message,
            conversation,
        }) => send_once(&mut ctx, message, conversation.as_deref()).await?,
        Some(Command::List) => list(&ctx),
        Some(Command::Sync) => sync(&ctx).await?,
        Some(Command::Tree { conversation }) => tree(&ctx, conversation)?,
        Some(Command::Streams { prune_hours }) => streams(&ctx, *prune_hours),
    }
    Ok(())
}

async fn send_once(
    ctx: &mut Context,
    message: &str,
    conversation: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let conversation_id = match conversation {
        Some(id) => id.to_string(),
        None => {
            ctx.engine
                .store()
                .create_conversation(None, ctx.model.as_deref())
                .await
                .id
        }
    };
    let options = SendOptions {
        model: ctx.model.clone(),
        ..SendOptions::default()
    };
    let engine = &ctx.engine;
    let outcome = repl::follow(
        engine.send_message(&conversation_id, message, Vec::new(), options),
        &mut ctx.events,
        || engine.stop_generation(&conversation_id),
    )
    .await?;
    tracing::debug!(
        conversation_id = %conversation_id,
        status = outcome.status.as_str(),
        tokens = outcome.tokens,
        "send finished"
    );
    Ok(())
}

fn list(ctx: &Context) {
    let conversations = ctx.engine.store().conversations();
    if conversations.is_empty() {
        println!("No conversations.");
        return;
    }
    for conversation in conversations {
        let count = ctx.engine.store().messages(&conversation.id).len();
        println!(
            "{}  {}  [{}, {count} messages]",
            conversation.id, conversation.title, conversation.model
        );
    }
}

async fn sync(ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let sent = match ctx.sync.process_sync_queue().await {
        Ok(sent) => sent,
        Err(err) => {
            println!("Could not replay the sync queue: {err}");
            0
        }
    };
    let pending = ctx.storage.pending_operations()?.len();
    println!("Delivered {sent} queued writes ({pending} still pending).");

    let store = ctx.engine.store();
    match store.sync_conversations().await {
        Ok(count) => {
            let synced = store.sync_all_messages().await;
            println!("Pulled {count} conversations, messages for {synced}.");
        }
        Err(err) => println!("Could not reach the backend: {err}"),
    }
    Ok(())
}

fn tree(ctx: &Context, conversation: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = ctx.engine.store();
    let id = store.resolve_id(conversation);
    if store.conversation(&id).is_none() {
        return Err(format!("conversation not found: {conversation}").into());
    }
    let tree = build_message_tree(&store.messages(&id));
    print!("{}", render::format_tree(&tree, &ctx.engine.active_path(&id)));
    Ok(())
}

/// Saturates instead of overflowing for absurd hour counts.
fn prune_age(hours: u64) -> Duration {
    Duration::from_secs(hours.saturating_mul(60 * 60))
}

fn streams(ctx: &Context, prune_hours: u64) {
    let recovery = ctx.engine.recovery();
    let interrupted = recovery.interrupted_streams();
    if interrupted.is_empty() {
        println!("No interrupted generations.");
    }
    for state in interrupted {
        println!(
            "{}  conversation {}  message {}  {} tokens  ({})",
            state.stream_id,
            state.conversation_id,
            state.message_id,
            state.tokens_generated,
            state.model
        );
    }

    let pruned = recovery.prune_finished(prune_age(prune_hours));
    if pruned > 0 {
        println!("Pruned {pruned} finished stream records.");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clap::Parser;

    use super::{Cli, Command, prune_age};

    #[test]
    fn prune_age_saturates() {
        assert_eq!(prune_age(24), Duration::from_secs(86_400));
        assert_eq!(prune_age(u64::MAX), Duration::from_secs(u64::MAX));
        let hours = u64::MAX.to_string();
        let cli = Cli::parse_from(["chatloom", "streams", "--prune-hours", hours.as_str()]);
        let Some(Command::Streams { prune_hours }) = cli.command else {
            panic!("expected streams command");
        };
        assert_eq!(prune_age(prune_hours), Duration::from_secs(u64::MAX));
    }
}
