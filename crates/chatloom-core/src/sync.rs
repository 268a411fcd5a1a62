//! Reconciling server listings with local optimistic state.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use chatloom_llm::Role;

use crate::model::{Conversation, Message};

/// Identity of a message for deduplication: role, text and a time bucket.
pub fn dedupe_key(message: &Message, window_ms: i64) -> (Role, String, i64) {
    (
        message.role,
        message.content.clone(),
        message.created_at_ms.div_euclid(window_ms.max(1)),
    )
}

/// Result of [`merge_messages`].
#[derive(Debug, Clone, Default)]
pub struct MessageMerge {
    pub messages: Vec<Message>,
    /// Temporary ids that matched a server message, mapped to that message's id.
    pub rekeyed: HashMap<String, String>,
}

/// Server messages win. A local message survives only while it still has a
/// temporary id and nothing on the server looks like it. A temporary message
/// that does match is rekeyed to the server id, and parent links follow it.
pub fn merge_messages(server: Vec<Message>, local: &[Message], window_ms: i64) -> MessageMerge {
    let mut merged: Vec<Message> = Vec::with_capacity(server.len() + local.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for message in server {
        match index.get(&message.id) {
            Some(&at) => merged[at] = message,
            None => {
                index.insert(message.id.clone(), merged.len());
                merged.push(message);
            }
        }
    }

    let mut server_keys: HashMap<(Role, String, i64), Vec<String>> = HashMap::new();
    for message in &merged {
        server_keys
            .entry(dedupe_key(message, window_ms))
            .or_default()
            .push(message.id.clone());
    }

    let mut rekeyed: HashMap<String, String> = HashMap::new();
    let mut claimed: HashSet<String> = HashSet::new();
    for message in local {
        if !message.is_temporary() || index.contains_key(&message.id) {
            continue;
        }
        if let Some(candidates) = server_keys.get(&dedupe_key(message, window_ms)) {
            // Identical replies in one bucket pair up in order.
            let target = candidates
                .iter()
                .find(|id| !claimed.contains(*id))
                .or_else(|| candidates.first());
            if let Some(target) = target {
                claimed.insert(target.clone());
                rekeyed.insert(message.id.clone(), target.clone());
            }
            continue;
        }
        index.insert(message.id.clone(), merged.len());
        merged.push(message.clone());
    }

    if !rekeyed.is_empty() {
        for message in &mut merged {
            if let Some(parent) = message.parent_id.as_ref().and_then(|p| rekeyed.get(p)) {
                message.parent_id = Some(parent.clone());
            }
        }
    }

    merged.sort_by_key(|m| m.created_at_ms);
    MessageMerge {
        messages: merged,
        rekeyed,
    }
}

/// Server records win by id, except ones deleted locally. Local records the
/// server does not know are kept while they are temporary or hold messages.
pub fn merge_conversations(
    server: Vec<Conversation>,
    local: &[Conversation],
    deleted: &HashSet<String>,
    has_messages: impl Fn(&str) -> bool,
) -> Vec<Conversation> {
    let mut merged: Vec<Conversation> = Vec::with_capacity(server.len() + local.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for conversation in server {
        if deleted.contains(&conversation.id) {
            continue;
        }
        match index.get(&conversation.id) {
            Some(&at) => merged[at] = conversation,
            None => {
                index.insert(conversation.id.clone(), merged.len());
                merged.push(conversation);
            }
        }
    }

    for conversation in local {
        if index.contains_key(&conversation.id) || deleted.contains(&conversation.id) {
            continue;
        }
        if conversation.is_temporary() || has_messages(&conversation.id) {
            index.insert(conversation.id.clone(), merged.len());
            merged.push(conversation.clone());
        }
    }

    merged.sort_by(|a, b| b.updated_at_ms.cmp(&a.updated_at_ms));
    merged
}

// ---------------------------------------------------------------------------
// Recently deleted
// ---------------------------------------------------------------------------

/// Conversation ids that must not come back from a sync that raced a delete.
///
/// Entries without an expiry stay until the server confirms the deletion.
#[derive(Debug, Clone, Default)]
pub struct RecentlyDeleted {
    entries: HashMap<String, Option<Instant>>,
}

impl RecentlyDeleted {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>) {
        self.entries.insert(id.into(), None);
    }

    /// The server confirmed the delete: keep masking for `grace`, then forget.
    pub fn confirm(&mut self, id: &str, grace: Duration, now: Instant) {
        if let Some(expiry) = self.entries.get_mut(id) {
            *expiry = Some(now + grace);
        }
    }

    pub fn purge_expired(&mut self, now: Instant) {
        self.entries
            .retain(|_, expiry| expiry.is_none_or(|at| at > now));
    }

    pub fn contains(&mut self, id: &str, now: Instant) -> bool {
        self.purge_expired(now);
        self.entries.contains_key(id)
    }

    /// Live ids after purging.
    pub fn snapshot(&mut self, now: Instant) -> HashSet<String> {
        self.purge_expired(now);
        self.entries.keys().cloned().collect()
    }
}
