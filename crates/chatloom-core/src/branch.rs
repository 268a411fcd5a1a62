//! Branch selection over a conversation's message forest.
//!
//! Siblings (messages sharing a parent) are alternative branches. The tree
//! remembers which sibling is active at every branch point; nothing is ever
//! removed by switching.

use std::collections::{HashMap, HashSet};

use crate::model::Message;

#[derive(Debug, Clone, Default)]
pub struct MessageTree {
    messages: HashMap<String, Message>,
    /// Parent id -> children, oldest first.
    children: HashMap<String, Vec<String>>,
    /// Messages without a resolvable parent, oldest first.
    roots: Vec<String>,
    /// Chosen child per branch point. `None` keys the root level.
    active: HashMap<Option<String>, String>,
}

pub fn build_message_tree(messages: &[Message]) -> MessageTree {
    let by_id: HashMap<String, Message> = messages
        .iter()
        .map(|m| (m.id.clone(), m.clone()))
        .collect();

    let mut ordered: Vec<&Message> = by_id.values().collect();
    ordered.sort_by(|a, b| {
        a.created_at_ms
            .cmp(&b.created_at_ms)
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut children: HashMap<String, Vec<String>> = HashMap::new();
    let mut roots = Vec::new();
    for message in ordered {
        match message.parent_id.as_deref() {
            Some(parent) if by_id.contains_key(parent) => children
                .entry(parent.to_string())
                .or_default()
                .push(message.id.clone()),
            _ => roots.push(message.id.clone()),
        }
    }

    MessageTree {
        messages: by_id,
        children,
        roots,
        active: HashMap::new(),
    }
}

/// Make `branch_id` part of the active path. Unknown ids leave the tree as is.
pub fn switch_to_branch(tree: &MessageTree, branch_id: &str) -> MessageTree {
    let mut next = tree.clone();
    if !next.messages.contains_key(branch_id) {
        tracing::warn!(branch_id, "switch to unknown branch ignored");
        return next;
    }

    let mut seen = HashSet::new();
    let mut cursor = Some(branch_id.to_string());
    while let Some(id) = cursor {
        if !seen.insert(id.clone()) {
            break;
        }
        let parent = next.effective_parent(&id);
        next.active.insert(parent.clone(), id);
        cursor = parent;
    }
    next
}

/// Root to deepest leaf following the active choice at each branch point.
pub fn get_active_path(tree: &MessageTree) -> Vec<Message> {
    let mut path = Vec::new();
    let mut seen = HashSet::new();
    let mut cursor = tree.active_child(None);
    while let Some(id) = cursor {
        if !seen.insert(id) {
            break;
        }
        let Some(message) = tree.messages.get(id) else {
            break;
        };
        path.push(message.clone());
        cursor = tree.active_child(Some(id));
    }
    path
}

impl MessageTree {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.get(id)
    }

    pub fn roots(&self) -> Vec<&Message> {
        self.roots
            .iter()
            .filter_map(|id| self.messages.get(id))
            .collect()
    }

    pub fn children(&self, id: &str) -> Vec<&Message> {
        self.children
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|child| self.messages.get(child))
            .collect()
    }

    /// All messages sharing a parent with `id`, including itself.
    pub fn siblings(&self, id: &str) -> Vec<&Message> {
        if !self.messages.contains_key(id) {
            return Vec::new();
        }
        self.sibling_ids(id)
            .iter()
            .filter_map(|sibling| self.messages.get(sibling))
            .collect()
    }

    /// Zero-based index of `id` among its siblings, and the sibling count.
    pub fn branch_position(&self, id: &str) -> Option<(usize, usize)> {
        if !self.messages.contains_key(id) {
            return None;
        }
        let siblings = self.sibling_ids(id);
        let index = siblings.iter().position(|s| s == id)?;
        Some((index, siblings.len()))
    }

    /// Ids of messages with more than one child.
    pub fn branch_points(&self) -> Vec<&str> {
        let mut points: Vec<&str> = self
            .children
            .iter()
            .filter(|(_, kids)| kids.len() > 1)
            .map(|(parent, _)| parent.as_str())
            .collect();
        points.sort_by_key(|id| self.messages.get(*id).map(|m| m.created_at_ms));
        points
    }

    pub fn active_leaf(&self) -> Option<&Message> {
        let mut seen = HashSet::new();
        let mut leaf = None;
        let mut cursor = self.active_child(None);
        while let Some(id) = cursor {
            if !seen.insert(id) {
                break;
            }
            leaf = self.messages.get(id);
            cursor = self.active_child(Some(id));
        }
        leaf
    }

    /// The selected child at a branch point, defaulting to the newest.
    fn active_child(&self, parent: Option<&str>) -> Option<&str> {
        let key = parent.map(str::to_string);
        if let Some(chosen) = self.active.get(&key) {
            return Some(chosen.as_str());
        }
        let candidates = match parent {
            Some(id) => self.children.get(id)?,
            None => &self.roots,
        };
        candidates.last().map(String::as_str)
    }

    fn effective_parent(&self, id: &str) -> Option<String> {
        self.messages
            .get(id)?
            .parent_id
            .as_ref()
            .filter(|parent| self.messages.contains_key(*parent))
            .cloned()
    }

    fn sibling_ids(&self, id: &str) -> &[String] {
        match self.effective_parent(id) {
            Some(parent) => self
                .children
                .get(&parent)
                .map(Vec::as_slice)
                .unwrap_or_default(),
            None => &self.roots,
        }
    }
}

#[cfg(test)]
mod tests {
    use chatloom_llm::Role;

    use super::{build_message_tree, get_active_path, switch_to_branch};
    use crate::model::Message;

    fn msg(id: &str, role: Role, parent: Option<&str>, at: i64) -> Message {
        Message::new(id, "c1", role, id)
            .parent(parent.map(str::to_string))
            .created_at(at)
    }

    fn fork() -> Vec<Message> {
        vec![
            msg("U1", Role::User, None, 1),
            msg("A1", Role::Assistant, Some("U1"), 2),
            msg("U2", Role::User, Some("A1"), 3),
            msg("A1b", Role::Assistant, Some("U1"), 4),
        ]
    }

    fn path_ids(path: &[Message]) -> Vec<&str> {
        path.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn newest_sibling_is_active_by_default() {
        let tree = build_message_tree(&fork());
        assert_eq!(tree.len(), 4);
        assert_eq!(path_ids(&get_active_path(&tree)), vec!["U1", "A1b"]);
        assert_eq!(tree.branch_points(), vec!["U1"]);
        assert_eq!(tree.branch_position("A1b"), Some((1, 2)));
        assert_eq!(tree.active_leaf().map(|m| m.id.as_str()), Some("A1b"));
    }

    #[test]
    fn switching_selects_the_whole_path() {
        let tree = build_message_tree(&fork());
        let switched = switch_to_branch(&tree, "A1");
        assert_eq!(path_ids(&get_active_path(&switched)), vec!["U1", "A1", "U2"]);
        assert_eq!(switched.len(), tree.len());

        let deep = switch_to_branch(&tree, "U2");
        assert_eq!(path_ids(&get_active_path(&deep)), vec!["U1", "A1", "U2"]);
    }

    #[test]
    fn unknown_branch_is_ignored() {
        let tree = build_message_tree(&fork());
        let same = switch_to_branch(&tree, "nope");
        assert_eq!(
            path_ids(&get_active_path(&same)),
            path_ids(&get_active_path(&tree))
        );
    }

    #[test]
    fn missing_parent_makes_a_root() {
        let messages = vec![
            msg("X", Role::User, None, 1),
            msg("Y", Role::Assistant, Some("gone"), 2),
        ];
        let tree = build_message_tree(&messages);
        assert_eq!(tree.roots().len(), 2);
        assert_eq!(tree.siblings("X").len(), 2);
        assert_eq!(tree.branch_position("nope"), None);
    }
}
