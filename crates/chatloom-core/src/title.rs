//! Conversation titles from the first user message.

use crate::config::DEFAULT_TITLE;

const MAX_TITLE_CHARS: usize = 30;
const MIN_CLEAN_CUT: usize = 20;
const PUNCTUATION: &[char] = &['?', '!', '.', ',', ';', ':'];

/// Whether a conversation is due for an automatic title.
pub fn should_retitle(current_title: &str, message_count: usize) -> bool {
    current_title == DEFAULT_TITLE && message_count == 2
}

pub fn derive_title(first_message: &str) -> String {
    let lower = first_message.to_ascii_lowercase();

    let title = if let Some(rest) = segment(first_message, &lower, &["how to", "how do"]) {
        prefixed("How to ", rest)
    } else if let Some(rest) = segment(first_message, &lower, &["what is", "what are"]) {
        prefixed("About ", rest)
    } else if let Some(rest) = segment(first_message, &lower, &["why"]) {
        format!("Why {}", rest.trim())
    } else if let Some(rest) = segment(first_message, &lower, &["can you", "could you"]) {
        capitalize(rest.trim())
    } else if let Some(rest) = segment(first_message, &lower, &["help"]) {
        format!("Help with {}", rest.trim())
    } else {
        first_message
            .chars()
            .filter(|c| !PUNCTUATION.contains(c))
            .collect::<String>()
            .split(' ')
            .filter(|word| word.chars().count() > 2)
            .take(4)
            .collect::<Vec<_>>()
            .join(" ")
    };

    let mut title: String = title
        .trim_end_matches(PUNCTUATION)
        .trim()
        .chars()
        .take(MAX_TITLE_CHARS)
        .collect();

    if title.chars().count() < 3 {
        title = first_message.chars().take(MAX_TITLE_CHARS).collect();
    }

    if title.chars().count() == MAX_TITLE_CHARS
        && !title.ends_with(' ')
        && let Some(space) = title.rfind(' ')
        && title[..space].chars().count() > MIN_CLEAN_CUT
    {
        title.truncate(space);
    }

    title
}

/// Text between the first occurrence of any pattern and the next occurrence
/// of any pattern (or the end). `lower` must be the ASCII-lowercased `text`.
fn segment<'a>(text: &'a str, lower: &str, patterns: &[&str]) -> Option<&'a str> {
    let (start, len) = patterns
        .iter()
        .filter_map(|p| lower.find(p).map(|at| (at, p.len())))
        .min_by_key(|(at, _)| *at)?;
    let from = start + len;
    let end = patterns
        .iter()
        .filter_map(|p| lower[from..].find(p).map(|at| from + at))
        .min()
        .unwrap_or(text.len());
    Some(&text[from..end])
}

fn prefixed(prefix: &str, rest: &str) -> String {
    let rest = rest.trim();
    if rest.is_empty() {
        String::new()
    } else {
        format!("{prefix}{rest}")
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
