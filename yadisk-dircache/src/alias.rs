//! Virtual folders that group unrelated real roots under one display path.
//!
//! Aliases are registered at the root of each grouped subtree; everything
//! nested below resolves through a longest-prefix lookup, walking the
//! queried path's ancestors against ordered maps.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::paths;
use crate::tree::TreeNode;

/// Display folder for directories the user has published.
pub const PUBLIC_GROUP: &str = "/Public";

/// Attribute carried by synthetic listing children.
const REAL_PATH_ATTRIBUTE: &str = "real_path";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasEntry {
    pub real_path: String,
    pub alias_path: String,
}

/// Bijection between real and alias paths.
#[derive(Debug, Clone, Default)]
pub struct AliasMapper {
    by_alias: BTreeMap<String, String>,
    by_real: BTreeMap<String, String>,
    groups: BTreeSet<String>,
}

impl AliasMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the pair, replacing any pair that already used either side.
    /// Returns `None` when a path cannot be normalized.
    pub fn register_alias(&mut self, real_path: &str, alias_path: &str) -> Option<AliasEntry> {
        let real_path = paths::normalize(real_path)?;
        let alias_path = paths::normalize(alias_path)?;

        if let Some(previous_real) = self.by_alias.remove(&alias_path) {
            self.by_real.remove(&previous_real);
        }
        if let Some(previous_alias) = self.by_real.remove(&real_path) {
            self.by_alias.remove(&previous_alias);
        }
        self.by_alias.insert(alias_path.clone(), real_path.clone());
        self.by_real.insert(real_path.clone(), alias_path.clone());
        Some(AliasEntry {
            real_path,
            alias_path,
        })
    }

    /// Real path behind `alias_path`, or `None` when no alias covers it.
    pub fn resolve_to_real(&self, alias_path: &str) -> Option<String> {
        longest_prefix(&self.by_alias, alias_path)
    }

    /// Alias path for `real_path`, or `None` when no alias covers it.
    pub fn resolve_to_alias(&self, real_path: &str) -> Option<String> {
        longest_prefix(&self.by_real, real_path)
    }

    /// With no prefix clears everything; otherwise removes the pairs whose
    /// alias is `prefix` or nested under it.
    pub fn reset(&mut self, prefix: Option<&str>) {
        let Some(prefix) = prefix else {
            self.by_alias.clear();
            self.by_real.clear();
            self.groups.clear();
            return;
        };
        let Some(prefix) = paths::normalize(prefix) else {
            return;
        };

        let doomed: Vec<String> = self
            .by_alias
            .keys()
            .filter(|alias| paths::is_within(alias, &prefix))
            .cloned()
            .collect();
        for alias in doomed {
            if let Some(real) = self.by_alias.remove(&alias) {
                self.by_real.remove(&real);
            }
        }
        self.groups.retain(|group| !paths::is_within(group, &prefix));
    }

    /// Replaces the group at `prefix` with one alias per real root, named
    /// after the root's last segment. Clashing names get ` (2)`, ` (3)`...
    pub fn rebuild_group<I, S>(&mut self, prefix: &str, reals: I) -> Vec<AliasEntry>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let Some(prefix) = paths::normalize(prefix) else {
            return Vec::new();
        };
        self.reset(Some(&prefix));
        self.groups.insert(prefix.clone());

        let mut registered = Vec::new();
        for real in reals {
            let Some(real) = paths::normalize(real.as_ref()) else {
                continue;
            };
            let already_grouped = self
                .by_real
                .get(&real)
                .is_some_and(|alias| paths::is_within(alias, &prefix));
            if real == "/" || already_grouped {
                continue;
            }
            let alias = self.free_child_path(&prefix, paths::file_name(&real));
            registered.extend(self.register_alias(&real, &alias));
        }
        registered
    }

    pub fn is_group(&self, path: &str) -> bool {
        self.groups.contains(path)
    }

    /// Directory node for a virtual folder: every alias directly below
    /// `prefix`, each pointing at its real path.
    pub fn synthetic_listing(&self, prefix: &str) -> TreeNode {
        let mut folder = TreeNode::placeholder_dir(prefix);
        for (alias, real) in &self.by_alias {
            if paths::parent(alias).as_deref() != Some(prefix) {
                continue;
            }
            let mut child = TreeNode::placeholder_dir(alias);
            child
                .attributes
                .insert(REAL_PATH_ATTRIBUTE.to_string(), Value::String(real.clone()));
            folder.children.push(child);
        }
        folder
    }

    /// Copy of a real tree for display. When the tree's own root is covered
    /// by an alias the whole tree is rebased onto it, so children keep
    /// extending their parent's path; an uncovered tree is returned as is.
    /// An aliased root also takes the alias's name.
    pub fn to_display(&self, node: &TreeNode) -> TreeNode {
        let mut display = node.clone();
        let Some(alias) = self.resolve_to_alias(&node.path) else {
            return display;
        };
        if self.by_real.contains_key(&node.path) {
            display.name = paths::file_name(&alias).to_string();
        }
        rebase(&mut display, &node.path, &alias);
        display
    }

    /// Adds a folder child for every group that lives directly in `node`.
    pub fn attach_groups(&self, node: &mut TreeNode) {
        if !node.is_dir {
            return;
        }
        for group in &self.groups {
            if paths::parent(group).as_deref() == Some(node.path.as_str()) {
                node.upsert_child(TreeNode::placeholder_dir(group));
            }
        }
    }

    pub fn entries(&self) -> Vec<AliasEntry> {
        self.by_alias
            .iter()
            .map(|(alias, real)| AliasEntry {
                real_path: real.clone(),
                alias_path: alias.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_alias.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_alias.is_empty()
    }

    fn free_child_path(&self, prefix: &str, name: &str) -> String {
        let mut candidate = paths::join(prefix, &format!("/{name}"));
        let mut suffix = 2;
        while self.by_alias.contains_key(&candidate) {
            candidate = paths::join(prefix, &format!("/{name} ({suffix})"));
            suffix += 1;
        }
        candidate
    }
}

/// Moves every path of `node` from under `from` to under `to`.
fn rebase(node: &mut TreeNode, from: &str, to: &str) {
    if paths::is_within(&node.path, from) {
        let rest = if from == "/" {
            node.path.as_str()
        } else {
            &node.path[from.len()..]
        };
        node.path = paths::join(to, rest);
    }
    for child in &mut node.children {
        rebase(child, from, to);
    }
}

/// Maps `path` through the deepest key of `map` that contains it.
fn longest_prefix(map: &BTreeMap<String, String>, path: &str) -> Option<String> {
    let path = paths::normalize(path)?;
    paths::ancestors(&path).find_map(|candidate| {
        let target = map.get(candidate)?;
        let rest = if candidate == "/" {
            path.as_str()
        } else {
            &path[candidate.len()..]
        };
        Some(paths::join(target, rest))
    })
}
