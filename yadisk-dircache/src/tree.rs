use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::paths;

/// Fields of an entry payload that the tree interprets itself.
const RESERVED_KEYS: [&str; 5] = ["path", "name", "isDir", "is_dir", "children"];

/// One filesystem entry. `path` is canonical and unique within a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub path: String,
    pub name: String,
    #[serde(rename = "isDir")]
    pub is_dir: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl TreeNode {
    /// Empty directory used when a listing produced nothing usable.
    pub fn placeholder_dir(path: &str) -> Self {
        Self {
            path: path.to_string(),
            name: paths::file_name(path).to_string(),
            is_dir: true,
            children: Vec::new(),
            attributes: Map::new(),
        }
    }

    /// Builds a childless node from a payload whose path is already canonical.
    pub fn from_payload(path: String, payload: &EntryPayload) -> Self {
        let mut node = Self {
            name: paths::file_name(&path).to_string(),
            path,
            is_dir: false,
            children: Vec::new(),
            attributes: Map::new(),
        };
        node.refine(payload);
        node
    }

    /// Overwrites `name`/`is_dir` when supplied and merges the remaining
    /// fields into `attributes`. Children are never touched here.
    pub fn refine(&mut self, payload: &EntryPayload) {
        if let Some(name) = payload.name.as_deref().filter(|name| !name.is_empty()) {
            self.name = name.to_string();
        }
        if let Some(is_dir) = payload.is_dir {
            self.is_dir = is_dir;
            if !is_dir {
                self.children.clear();
            }
        }
        for (key, value) in &payload.attributes {
            if !RESERVED_KEYS.contains(&key.as_str()) {
                self.attributes.insert(key.clone(), value.clone());
            }
        }
    }

    pub fn is_hidden(&self) -> bool {
        self.name.starts_with('.')
    }

    pub fn find(&self, path: &str) -> Option<&TreeNode> {
        if self.path == path {
            return Some(self);
        }
        if !paths::is_within(path, &self.path) {
            return None;
        }
        self.children.iter().find_map(|child| child.find(path))
    }

    /// Every path in the tree, depth-first, parents before children.
    pub fn paths(&self) -> Vec<&str> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            out.push(node.path.as_str());
            stack.extend(node.children.iter().rev());
        }
        out
    }

    /// Replaces the direct child with the same path, or appends it.
    pub fn upsert_child(&mut self, child: TreeNode) {
        match self.children.iter_mut().find(|c| c.path == child.path) {
            Some(existing) => *existing = child,
            None => self.children.push(child),
        }
    }
}

/// Partial entry carried by an entry-arrival message. Anything besides
/// `path`, `name` and `isDir` passes through as opaque attributes.
/// `is_dir` is accepted too; `isDir` wins when both are present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawEntryPayload")]
pub struct EntryPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "isDir", skip_serializing_if = "Option::is_none")]
    pub is_dir: Option<bool>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

#[derive(Deserialize)]
struct RawEntryPayload {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "isDir")]
    is_dir_camel: Option<bool>,
    #[serde(default, rename = "is_dir")]
    is_dir_snake: Option<bool>,
    #[serde(flatten)]
    attributes: Map<String, Value>,
}

impl From<RawEntryPayload> for EntryPayload {
    fn from(raw: RawEntryPayload) -> Self {
        Self {
            path: raw.path,
            name: raw.name,
            is_dir: raw.is_dir_camel.or(raw.is_dir_snake),
            attributes: raw.attributes,
        }
    }
}

impl EntryPayload {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn dir(path: impl Into<String>) -> Self {
        Self {
            is_dir: Some(true),
            ..Self::new(path)
        }
    }

    pub fn file(path: impl Into<String>) -> Self {
        Self {
            is_dir: Some(false),
            ..Self::new(path)
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Dot-files, judged by the supplied name or else the last path segment.
    pub fn is_hidden(&self) -> bool {
        let name = match (&self.name, &self.path) {
            (Some(name), _) => name.as_str(),
            (None, Some(path)) => paths::file_name(path),
            (None, None) => return false,
        };
        name.starts_with('.')
    }

    /// Canonical path, or `None` when the payload is malformed.
    pub fn normalized_path(&self) -> Option<String> {
        self.path.as_deref().and_then(paths::normalize)
    }

    /// A standalone node for this payload, used by single-entry updates.
    pub fn into_node(self) -> Option<TreeNode> {
        let path = self.normalized_path()?;
        Some(TreeNode::from_payload(path, &self))
    }
}
