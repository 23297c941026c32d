//! Topic tree and retained store.
//!
//! A flat map from full path to [`TopicNode`], with parent and child links
//! stored as paths rather than references. The empty path `""` is the root
//! node and always exists.

use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

use crate::error::{BusError, BusResult};
use crate::metadata::Metadata;

/// Path segment separator.
pub const SEPARATOR: char = '/';
/// Suffix appended to a topic when delivering metadata changes.
pub const METADATA_SUFFIX: char = '$';
/// Suffix appended to a topic when delivering removal notices.
pub const REMOVE_SUFFIX: char = '~';
/// Prefix of non-retained leaf names (actions, events, callbacks).
pub const TRANSIENT_PREFIX: char = '!';

/// Split a path into its segments, rejecting empty paths and segments.
pub fn split_path(path: &str) -> BusResult<Vec<&str>> {
    if path.is_empty() {
        return Err(BusError::InvalidPath(path.to_string()));
    }
    let segments: Vec<&str> = path.split(SEPARATOR).collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(BusError::InvalidPath(path.to_string()));
    }
    Ok(segments)
}

/// Parent path, `""` for top-level topics and `None` for the root.
pub fn parent_of(path: &str) -> Option<&str> {
    if path.is_empty() {
        return None;
    }
    Some(path.rsplit_once(SEPARATOR).map_or("", |(parent, _)| parent))
}

/// Last path segment.
pub fn last_segment(path: &str) -> &str {
    path.rsplit_once(SEPARATOR).map_or(path, |(_, name)| name)
}

/// True for leaves that deliver values without retaining them.
pub fn is_transient(path: &str) -> bool {
    last_segment(path).starts_with(TRANSIENT_PREFIX)
}

/// Join a parent path and a child name.
pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}{}{}", parent, SEPARATOR, name)
    }
}

/// Proper ancestors of `path`, nearest first, ending with the root `""`.
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(parent_of(path), |p| parent_of(p))
}

/// True if `path` lies strictly below `ancestor`.
pub fn is_descendant(path: &str, ancestor: &str) -> bool {
    if ancestor.is_empty() {
        return !path.is_empty();
    }
    path.strip_prefix(ancestor)
        .is_some_and(|rest| rest.starts_with(SEPARATOR))
}

/// Whether a topic is a container or holds a value.
#[derive(Debug, Clone, PartialEq)]
pub enum TopicKind {
    /// Interior hierarchy node.
    Node,
    /// Typed value holder.
    Leaf {
        /// Value contract.
        metadata: Metadata,
        /// Last accepted value.
        retained: Option<Value>,
    },
}

/// One entry of the topic tree.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicNode {
    /// Full path.
    pub path: String,
    /// Parent path (`None` only for the root).
    pub parent: Option<String>,
    /// Child paths in creation order.
    pub children: Vec<String>,
    /// Node or leaf payload.
    pub kind: TopicKind,
}

impl TopicNode {
    fn node(path: String, parent: Option<String>) -> Self {
        Self {
            path,
            parent,
            children: Vec::new(),
            kind: TopicKind::Node,
        }
    }

    /// Metadata for leaves, `None` for nodes.
    pub fn metadata(&self) -> Option<&Metadata> {
        match &self.kind {
            TopicKind::Leaf { metadata, .. } => Some(metadata),
            TopicKind::Node => None,
        }
    }

    /// Retained value, if any.
    pub fn retained(&self) -> Option<&Value> {
        match &self.kind {
            TopicKind::Leaf { retained, .. } => retained.as_ref(),
            TopicKind::Node => None,
        }
    }

    /// True for container nodes.
    pub fn is_node(&self) -> bool {
        matches!(self.kind, TopicKind::Node)
    }
}

/// Result of [`TopicTree::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// A new topic was created.
    Created,
    /// The topic already existed with identical metadata.
    Unchanged,
    /// The topic existed and its metadata was replaced.
    Replaced,
}

/// Hierarchical namespace of topics.
#[derive(Debug, Clone)]
pub struct TopicTree {
    nodes: HashMap<String, TopicNode>,
}

impl Default for TopicTree {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicTree {
    /// Tree holding only the root.
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(String::new(), TopicNode::node(String::new(), None));
        Self { nodes }
    }

    /// Look up a topic.
    pub fn get(&self, path: &str) -> Option<&TopicNode> {
        self.nodes.get(path)
    }

    /// True if the topic exists.
    pub fn contains(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    /// Number of topics, excluding the root.
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    /// True when only the root exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every path in the tree, excluding the root.
    pub fn paths(&self) -> BTreeSet<String> {
        self.nodes.keys().filter(|p| !p.is_empty()).cloned().collect()
    }

    /// Check whether [`TopicTree::add`] would succeed, without mutating.
    pub fn check_add(&self, path: &str, metadata: &Metadata, exists_ok: bool) -> BusResult<AddOutcome> {
        let segments = split_path(path)?;
        let mut prefix = String::new();
        for segment in &segments[..segments.len() - 1] {
            prefix = join(&prefix, segment);
            if let Some(node) = self.nodes.get(&prefix) {
                if !node.is_node() {
                    return Err(BusError::TopicConflict {
                        path: path.to_string(),
                        reason: format!("ancestor '{}' is a leaf", prefix),
                    });
                }
            }
        }
        match self.nodes.get(path) {
            None => Ok(AddOutcome::Created),
            Some(existing) => {
                let same = match (&existing.kind, metadata.is_node()) {
                    (TopicKind::Node, true) => true,
                    (TopicKind::Leaf { metadata: m, .. }, false) => m == metadata,
                    _ => false,
                };
                if same {
                    Ok(AddOutcome::Unchanged)
                } else if !exists_ok {
                    Err(BusError::TopicConflict {
                        path: path.to_string(),
                        reason: "exists with different metadata".into(),
                    })
                } else if existing.is_node() && !existing.children.is_empty() {
                    Err(BusError::TopicConflict {
                        path: path.to_string(),
                        reason: "node with children cannot become a leaf".into(),
                    })
                } else {
                    Ok(AddOutcome::Replaced)
                }
            }
        }
    }

    /// Create a topic and any missing ancestor nodes.
    ///
    /// Replacing a leaf's metadata keeps its retained value when the value
    /// still validates, and drops it otherwise.
    pub fn add(&mut self, path: &str, metadata: Metadata, exists_ok: bool) -> BusResult<AddOutcome> {
        let outcome = self.check_add(path, &metadata, exists_ok)?;
        let kind = if metadata.is_node() {
            TopicKind::Node
        } else {
            TopicKind::Leaf {
                metadata,
                retained: None,
            }
        };
        match outcome {
            AddOutcome::Unchanged => {}
            AddOutcome::Created => {
                let mut parent = String::new();
                for segment in split_path(path)? {
                    let child = join(&parent, segment);
                    if !self.nodes.contains_key(&child) {
                        self.nodes
                            .insert(child.clone(), TopicNode::node(child.clone(), Some(parent.clone())));
                        if let Some(p) = self.nodes.get_mut(&parent) {
                            p.children.push(child.clone());
                        }
                    }
                    parent = child;
                }
                if let Some(node) = self.nodes.get_mut(path) {
                    node.kind = kind;
                }
            }
            AddOutcome::Replaced => {
                if let Some(node) = self.nodes.get_mut(path) {
                    let previous = node.retained().cloned();
                    node.kind = match kind {
                        TopicKind::Leaf { metadata, .. } => {
                            let retained = previous.and_then(|v| metadata.validate(&v).ok());
                            TopicKind::Leaf { metadata, retained }
                        }
                        TopicKind::Node => TopicKind::Node,
                    };
                }
            }
        }
        Ok(outcome)
    }

    /// Remove a topic and its subtree.
    ///
    /// Empty ancestor nodes collapse unless `keep` returns true for them.
    /// Returns every removed path, deepest first.
    pub fn remove(&mut self, path: &str, keep: impl Fn(&str) -> bool) -> BusResult<Vec<String>> {
        split_path(path)?;
        if !self.nodes.contains_key(path) {
            return Err(BusError::TopicNotFound(path.to_string()));
        }
        let mut removed = self.descendants(path);
        removed.reverse();
        removed.push(path.to_string());
        for p in &removed {
            self.nodes.remove(p);
        }

        let mut child = path.to_string();
        let mut parent = parent_of(path).map(str::to_string);
        while let Some(p) = parent {
            let Some(node) = self.nodes.get_mut(&p) else {
                break;
            };
            node.children.retain(|c| c != &child);
            if p.is_empty() || !node.children.is_empty() || !node.is_node() || keep(&p) {
                break;
            }
            self.nodes.remove(&p);
            removed.push(p.clone());
            parent = parent_of(&p).map(str::to_string);
            child = p;
        }
        Ok(removed)
    }

    /// Child paths of a topic.
    pub fn children(&self, path: &str) -> BusResult<&[String]> {
        self.nodes
            .get(path)
            .map(|n| n.children.as_slice())
            .ok_or_else(|| BusError::TopicNotFound(path.to_string()))
    }

    /// All descendants, depth-first pre-order, excluding `path` itself.
    pub fn descendants(&self, path: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack: Vec<&str> = match self.nodes.get(path) {
            Some(node) => node.children.iter().rev().map(String::as_str).collect(),
            None => return out,
        };
        while let Some(p) = stack.pop() {
            out.push(p.to_string());
            if let Some(node) = self.nodes.get(p) {
                stack.extend(node.children.iter().rev().map(String::as_str));
            }
        }
        out
    }

    /// Retained value of a leaf.
    pub fn retained(&self, path: &str) -> Option<&Value> {
        self.nodes.get(path).and_then(TopicNode::retained)
    }

    /// Replace a leaf's retained value, returning the previous one.
    ///
    /// Callers must have validated `value` against the leaf's metadata.
    pub(crate) fn replace_retained(&mut self, path: &str, value: Option<Value>) -> Option<Value> {
        match self.nodes.get_mut(path).map(|n| &mut n.kind) {
            Some(TopicKind::Leaf { retained, .. }) => std::mem::replace(retained, value),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Dtype;
    use serde_json::json;

    fn int_meta() -> Metadata {
        Metadata::new(Dtype::Int)
    }

    #[test]
    fn test_path_helpers() {
        assert!(split_path("").is_err());
        assert!(split_path("a//b").is_err());
        assert!(split_path("a/").is_err());
        assert_eq!(split_path("a/b").unwrap(), vec!["a", "b"]);
        assert_eq!(parent_of("a/b/c"), Some("a/b"));
        assert_eq!(parent_of("a"), Some(""));
        assert_eq!(parent_of(""), None);
        assert_eq!(last_segment("a/b/!x"), "!x");
        assert!(is_transient("registry/Foo/actions/!go"));
        assert!(!is_transient("registry/Foo/settings/go"));
        assert_eq!(ancestors("a/b/c").collect::<Vec<_>>(), vec!["a/b", "a", ""]);
        assert!(is_descendant("a/b/c", "a"));
        assert!(is_descendant("a", ""));
        assert!(!is_descendant("ab/c", "a"));
        assert!(!is_descendant("a", "a"));
    }

    #[test]
    fn test_add_creates_ancestors() {
        let mut tree = TopicTree::new();
        assert_eq!(tree.add("a/b/c", int_meta(), false).unwrap(), AddOutcome::Created);
        assert!(tree.get("a").unwrap().is_node());
        assert!(tree.get("a/b").unwrap().is_node());
        assert!(!tree.get("a/b/c").unwrap().is_node());
        assert_eq!(tree.children("a").unwrap(), &["a/b".to_string()]);
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_add_existing_same_metadata_is_unchanged() {
        let mut tree = TopicTree::new();
        tree.add("a/x", int_meta(), false).unwrap();
        assert_eq!(tree.add("a/x", int_meta(), false).unwrap(), AddOutcome::Unchanged);
    }

    #[test]
    fn test_add_conflicting_metadata() {
        let mut tree = TopicTree::new();
        tree.add("a/x", int_meta(), false).unwrap();
        let other = Metadata::new(Dtype::Str);
        assert!(matches!(
            tree.add("a/x", other.clone(), false),
            Err(BusError::TopicConflict { .. })
        ));
        assert_eq!(tree.add("a/x", other, true).unwrap(), AddOutcome::Replaced);
        assert_eq!(tree.get("a/x").unwrap().metadata().unwrap().dtype, Dtype::Str);
    }

    #[test]
    fn test_leaf_cannot_have_children() {
        let mut tree = TopicTree::new();
        tree.add("a/x", int_meta(), false).unwrap();
        assert!(matches!(
            tree.add("a/x/y", int_meta(), true),
            Err(BusError::TopicConflict { .. })
        ));
    }

    #[test]
    fn test_replace_keeps_valid_retained() {
        let mut tree = TopicTree::new();
        tree.add("a/x", int_meta(), false).unwrap();
        tree.replace_retained("a/x", Some(json!(4)));
        tree.add("a/x", int_meta().with_range(0.0, 10.0), true).unwrap();
        assert_eq!(tree.retained("a/x"), Some(&json!(4)));
        tree.add("a/x", int_meta().with_range(5.0, 10.0), true).unwrap();
        assert_eq!(tree.retained("a/x"), None);
    }

    #[test]
    fn test_remove_collapses_empty_ancestors() {
        let mut tree = TopicTree::new();
        tree.add("a/b/c", int_meta(), false).unwrap();
        tree.add("a/d", int_meta(), false).unwrap();
        let removed = tree.remove("a/b/c", |_| false).unwrap();
        assert_eq!(removed, vec!["a/b/c".to_string(), "a/b".to_string()]);
        assert!(tree.contains("a"));
        tree.remove("a/d", |_| false).unwrap();
        assert!(tree.is_empty());
    }

    #[test]
    fn test_remove_keeps_requested_ancestors() {
        let mut tree = TopicTree::new();
        tree.add("a/b/c", int_meta(), false).unwrap();
        let removed = tree.remove("a/b/c", |p| p == "a").unwrap();
        assert_eq!(removed.len(), 2);
        assert!(tree.contains("a"));
    }

    #[test]
    fn test_remove_subtree_deepest_first() {
        let mut tree = TopicTree::new();
        tree.add("r/s/t", int_meta(), false).unwrap();
        tree.add("r/s/u", int_meta(), false).unwrap();
        let removed = tree.remove("r/s", |_| false).unwrap();
        assert_eq!(
            removed,
            vec!["r/s/u".to_string(), "r/s/t".to_string(), "r/s".to_string(), "r".to_string()]
        );
        assert!(matches!(tree.remove("r", |_| false), Err(BusError::TopicNotFound(_))));
    }

    #[test]
    fn test_descendants_preorder() {
        let mut tree = TopicTree::new();
        tree.add("a/b/c", int_meta(), false).unwrap();
        tree.add("a/b/d", int_meta(), false).unwrap();
        tree.add("a/e", int_meta(), false).unwrap();
        assert_eq!(tree.descendants("a"), vec!["a/b", "a/b/c", "a/b/d", "a/e"]);
    }
}
