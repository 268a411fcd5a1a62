//! Terminal output: streamed replies and message trees.

use std::collections::HashSet;
use std::io::{self, Write};

use chatloom_core::{EngineEvent, Message, MessageTree};

const PREVIEW_CHARS: usize = 60;

/// What to print for a new full-content snapshot.
#[derive(Debug, PartialEq, Eq)]
enum Output<'a> {
    Nothing,
    /// The new content extends what is on screen.
    Append(&'a str),
    /// The content was rewritten (placeholders); print it on a fresh line.
    Replace(&'a str),
}

fn next_output<'a>(printed: &str, content: &'a str) -> Output<'a> {
    match content.strip_prefix(printed) {
        Some("") => Output::Nothing,
        Some(rest) => Output::Append(rest),
        None => Output::Replace(content),
    }
}

/// Prints engine events for one generation as a continuously growing line.
#[derive(Debug, Default)]
pub struct StreamPrinter {
    printed: String,
}

impl StreamPrinter {
    pub fn handle(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::ContentUpdated { content, .. } => self.show(content),
            EngineEvent::ImageResolved { content, .. } => {
                println!();
                println!("{content}");
            }
            EngineEvent::TitleUpdated { title, .. } => {
                eprintln!("\n[conversation titled \"{title}\"]");
            }
            EngineEvent::PhaseChanged { .. }
            | EngineEvent::TokensUpdated { .. }
            | EngineEvent::Progress { .. } => {}
        }
    }

    fn show(&mut self, content: &str) {
        match next_output(&self.printed, content) {
            Output::Nothing => return,
            Output::Append(rest) => print!("{rest}"),
            Output::Replace(all) => {
                if !self.printed.is_empty() {
                    println!();
                }
                print!("{all}");
            }
        }
        self.printed = content.to_string();
        let _ = io::stdout().flush();
    }

    pub fn finish(&mut self) {
        if !self.printed.is_empty() {
            println!();
        }
        self.printed.clear();
    }
}

/// One line per message, children indented under their parent. `*` marks
/// the active path; `[i/n]` shows the position among siblings.
pub fn format_tree(tree: &MessageTree, active: &[Message]) -> String {
    let active: HashSet<&str> = active.iter().map(|m| m.id.as_str()).collect();
    let mut out = String::new();
    let mut seen = HashSet::new();
    for root in tree.roots() {
        format_node(tree, root, 0, &active, &mut seen, &mut out);
    }
    out
}

fn format_node<'t>(
    tree: &'t MessageTree,
    message: &'t Message,
    depth: usize,
    active: &HashSet<&str>,
    seen: &mut HashSet<&'t str>,
    out: &mut String,
) {
    if !seen.insert(message.id.as_str()) {
        return;
    }
    let marker = if active.contains(message.id.as_str()) { '*' } else { ' ' };
    let position = tree
        .branch_position(&message.id)
        .filter(|(_, count)| *count > 1)
        .map(|(index, count)| format!(" [{}/{count}]", index + 1))
        .unwrap_or_default();
    out.push_str(&format!(
        "{}{marker} {} {}{position}: {}\n",
        "  ".repeat(depth),
        message.role.as_str(),
        message.id,
        preview(&message.content),
    ));
    for child in tree.children(&message.id) {
        format_node(tree, child, depth + 1, active, seen, out);
    }
}

fn preview(content: &str) -> String {
    let flat = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= PREVIEW_CHARS {
        return flat;
    }
    let cut: String = flat.chars().take(PREVIEW_CHARS).collect();
    format!("{cut}…")
}
