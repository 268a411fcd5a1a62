//! Line-based interactive chat.

use std::future::Future;
use std::io::{self, Write};

use chatloom_core::{EngineError, EngineEvent, GenerationOutcome, SendOptions, StreamStatus};
use chatloom_llm::Role;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::context::Context;
use crate::render::{self, StreamPrinter};

const HELP: &str = "\
/new            start a new conversation
/regen          regenerate the last reply
/branch         generate an alternative to the last reply
/tree           show the message tree
/switch <id>    continue from another branch
/quit           exit (Ctrl-D works too)
Ctrl-C while a reply streams stops it.";

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Empty,
    Message(String),
    New,
    Regenerate,
    Branch,
    Tree,
    Switch(String),
    Help,
    Quit,
    Unknown(String),
}

impl Input {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Input::Empty;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Input::Message(line.to_string());
        };
        let (name, arg) = match command.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (command, ""),
        };
        match (name, arg) {
            ("new", _) => Input::New,
            ("regen" | "regenerate", _) => Input::Regenerate,
            ("branch", _) => Input::Branch,
            ("tree", _) => Input::Tree,
            ("switch", id) if !id.is_empty() => Input::Switch(id.to_string()),
            ("help" | "?", _) => Input::Help,
            ("quit" | "exit" | "q", _) => Input::Quit,
            _ => Input::Unknown(line.to_string()),
        }
    }
}

pub async fn run(
    ctx: &mut Context,
    conversation: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut conversation_id = match conversation {
        Some(id) => {
            let store = ctx.engine.store();
            let id = store.resolve_id(id);
            if store.conversation(&id).is_none() {
                return Err(format!("conversation not found: {id}").into());
            }
            if let Err(err) = store.sync_messages(&id).await {
                tracing::warn!(conversation_id = %id, error = %err, "using cached messages");
            }
            id
        }
        None => new_conversation(ctx).await,
    };
    print_history(ctx, &conversation_id);
    println!("Type /help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        drain_events(&mut ctx.events);
        print!("> ");
        io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            println!();
            break;
        };

        let result = match Input::parse(&line) {
            Input::Empty => continue,
            Input::Quit => break,
            Input::Help => {
                println!("{HELP}");
                continue;
            }
            Input::Unknown(text) => {
                println!("Unknown command: {text}");
                continue;
            }
            Input::New => {
                conversation_id = new_conversation(ctx).await;
                continue;
            }
            Input::Tree => {
                let store = ctx.engine.store();
                let tree = chatloom_core::build_message_tree(&store.messages(&conversation_id));
                print!(
                    "{}",
                    render::format_tree(&tree, &ctx.engine.active_path(&conversation_id))
                );
                continue;
            }
            Input::Switch(id) => {
                match ctx.engine.switch_branch(&conversation_id, &id) {
                    Ok(path) => {
                        if let Some(leaf) = path.last() {
                            println!("Now on {} ({})", leaf.id, leaf.role.as_str());
                        }
                    }
                    Err(err) => println!("{err}"),
                }
                continue;
            }
            Input::Message(text) => {
                let options = SendOptions {
                    model: ctx.model.clone(),
                    ..SendOptions::default()
                };
                let engine = &ctx.engine;
                follow(
                    engine.send_message(&conversation_id, &text, Vec::new(), options),
                    &mut ctx.events,
                    || engine.stop_generation(&conversation_id),
                )
                .await
            }
            Input::Regenerate => {
                let Some(leaf) = last_reply(ctx, &conversation_id) else {
                    println!("Nothing to regenerate.");
                    continue;
                };
                let engine = &ctx.engine;
                follow(
                    engine.regenerate(&conversation_id, &leaf),
                    &mut ctx.events,
                    || engine.stop_generation(&conversation_id),
                )
                .await
            }
            Input::Branch => {
                let Some(leaf) = last_reply(ctx, &conversation_id) else {
                    println!("Nothing to branch from.");
                    continue;
                };
                let engine = &ctx.engine;
                follow(
                    engine.create_branch(&conversation_id, &leaf),
                    &mut ctx.events,
                    || engine.stop_generation(&conversation_id),
                )
                .await
            }
        };

        match result {
            Ok(outcome) if outcome.status == StreamStatus::Aborted => println!("[stopped]"),
            Ok(_) => {}
            Err(err) => println!("{err}"),
        }
        // Sends may have moved the conversation to its server id.
        conversation_id = ctx.engine.store().resolve_id(&conversation_id);
    }
    Ok(())
}

/// Drive one generation to completion, printing its events as they arrive.
/// `stop` is called on Ctrl-C.
pub async fn follow<F>(
    flow: F,
    events: &mut mpsc::UnboundedReceiver<EngineEvent>,
    stop: impl Fn() -> bool,
) -> Result<GenerationOutcome, EngineError>
where
    F: Future<Output = Result<GenerationOutcome, EngineError>>,
{
    let mut printer = StreamPrinter::default();
    let mut flow = std::pin::pin!(flow);
    let mut stopped = false;
    let result = loop {
        tokio::select! {
            result = &mut flow => break result,
            Some(event) = events.recv() => printer.handle(&event),
            _ = tokio::signal::ctrl_c(), if !stopped => stopped = stop(),
        }
    };
    while let Ok(event) = events.try_recv() {
        printer.handle(&event);
    }
    printer.finish();
    result
}

/// Print events that arrived while the prompt was idle, such as a resolved
/// image or a new title.
fn drain_events(events: &mut mpsc::UnboundedReceiver<EngineEvent>) {
    let mut printer = StreamPrinter::default();
    while let Ok(event) = events.try_recv() {
        if matches!(
            event,
            EngineEvent::ImageResolved { .. } | EngineEvent::TitleUpdated { .. }
        ) {
            printer.handle(&event);
        }
    }
}

async fn new_conversation(ctx: &Context) -> String {
    let conversation = ctx
        .engine
        .store()
        .create_conversation(None, ctx.model.as_deref())
        .await;
    println!(
        "Started \"{}\" ({}, {})",
        conversation.title, conversation.id, conversation.model
    );
    conversation.id
}

fn last_reply(ctx: &Context, conversation_id: &str) -> Option<String> {
    ctx.engine
        .active_path(conversation_id)
        .into_iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .map(|m| m.id)
}

fn print_history(ctx: &Context, conversation_id: &str) {
    for message in ctx.engine.active_path(conversation_id) {
        let speaker = match message.role {
            Role::User => "you",
            Role::Assistant => "assistant",
            Role::System => continue,
        };
        println!("{speaker}: {}", message.content);
    }
}
