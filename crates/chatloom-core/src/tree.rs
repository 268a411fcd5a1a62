//! Read-only queries over one conversation's message forest.
//!
//! All functions take a snapshot slice. Parent links may point at messages
//! that have not been merged in yet, so every walk tolerates gaps.

use std::collections::HashSet;

use crate::model::Message;

/// Result of walking parent links from a leaf.
#[derive(Debug, Clone, PartialEq)]
pub struct RootPath<'a> {
    /// Root first, leaf last.
    pub messages: Vec<&'a Message>,
    /// Set when the walk stopped at a parent id that is not in the snapshot.
    pub dangling_parent: Option<String>,
}

impl RootPath<'_> {
    pub fn is_complete(&self) -> bool {
        self.dangling_parent.is_none()
    }
}

pub fn parent_of<'a>(messages: &'a [Message], message: &Message) -> Option<&'a Message> {
    let parent_id = message.parent_id.as_deref()?;
    messages.iter().find(|m| m.id == parent_id)
}

/// Direct children of `id`, oldest first.
pub fn children_of<'a>(messages: &'a [Message], id: &str) -> Vec<&'a Message> {
    let mut children: Vec<&Message> = messages
        .iter()
        .filter(|m| m.parent_id.as_deref() == Some(id))
        .collect();
    children.sort_by_key(|m| m.created_at_ms);
    children
}

/// Follow parent links from `leaf_id` up to a root.
///
/// An unknown leaf yields an empty path. A repeated id ends the walk.
pub fn path_to_root<'a>(messages: &'a [Message], leaf_id: &str) -> RootPath<'a> {
    let mut path = Vec::new();
    let mut seen = HashSet::new();
    let mut dangling_parent = None;

    let mut cursor = messages.iter().find(|m| m.id == leaf_id);
    while let Some(message) = cursor {
        if !seen.insert(message.id.as_str()) {
            break;
        }
        path.push(message);

        let Some(parent_id) = message.parent_id.as_deref() else {
            break;
        };
        cursor = messages.iter().find(|m| m.id == parent_id);
        if cursor.is_none() {
            dangling_parent = Some(parent_id.to_string());
        }
    }

    path.reverse();
    RootPath {
        messages: path,
        dangling_parent,
    }
}

/// The context a model should see before `message_id`.
///
/// Uses the parent chain when it reaches a real root. Otherwise falls back
/// to list order: everything before the message (or before the top of the
/// partial chain), then the resolved chain.
pub fn context_before(messages: &[Message], message_id: &str) -> Vec<Message> {
    let Some(index) = messages.iter().position(|m| m.id == message_id) else {
        return Vec::new();
    };
    let target = &messages[index];

    let Some(parent_id) = target.parent_id.as_deref() else {
        return messages[..index].to_vec();
    };
    if !messages.iter().any(|m| m.id == parent_id) {
        return messages[..index].to_vec();
    }

    let chain = path_to_root(messages, parent_id);
    if chain.is_complete() {
        return chain.messages.into_iter().cloned().collect();
    }

    let Some(top) = chain.messages.first() else {
        return messages[..index].to_vec();
    };
    let top_index = messages
        .iter()
        .position(|m| m.id == top.id)
        .unwrap_or(index);

    let chain_ids: HashSet<&str> = chain.messages.iter().map(|m| m.id.as_str()).collect();
    let mut context: Vec<Message> = messages[..top_index]
        .iter()
        .filter(|m| !chain_ids.contains(m.id.as_str()))
        .cloned()
        .collect();
    context.extend(chain.messages.into_iter().cloned());
    context
}
