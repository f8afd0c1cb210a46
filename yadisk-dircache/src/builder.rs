//! Incremental tree assembly for one directory read.
//!
//! [`TreeBuilder`] is the state machine; [`BuilderWorker`] runs one on a
//! dedicated thread and talks to it only through channels, so every
//! snapshot that leaves the worker is an owned copy.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::paths;
use crate::tree::{EntryPayload, TreeNode};

const DEFAULT_TICK_MS: u64 = 16;
const DEFAULT_FLUSH_EVERY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuilderConfig {
    /// Minimum spacing between two partial snapshots.
    pub tick: Duration,
    /// A partial snapshot is forced after this many entries regardless of `tick`.
    pub flush_every: usize,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(DEFAULT_TICK_MS),
            flush_every: DEFAULT_FLUSH_EVERY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    /// Emitted by `init`; carries no tree.
    Reset,
    Partial,
    Final,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Incremented on every `init`; snapshots of an older build are stale.
    pub build: u64,
    pub root: String,
    pub kind: SnapshotKind,
    pub tree: Option<TreeNode>,
}

#[derive(Debug, Clone)]
pub enum BuildCommand {
    Init(String),
    Entry(EntryPayload),
    Done,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Collecting,
}

struct Slot {
    node: TreeNode,
    children: Vec<String>,
    linked: bool,
    /// Whether any payload stated `isDir`; otherwise having children makes it a directory.
    kind_known: bool,
}

impl Slot {
    fn new(node: TreeNode, kind_known: bool) -> Self {
        Self {
            node,
            children: Vec::new(),
            linked: false,
            kind_known,
        }
    }

    fn stub(path: &str) -> Self {
        Self::new(TreeNode::placeholder_dir(path), false)
    }
}

pub struct TreeBuilder {
    config: BuilderConfig,
    state: State,
    cancelled: bool,
    build: u64,
    root: String,
    root_established: bool,
    nodes: HashMap<String, Slot>,
    since_flush: usize,
    last_emit: Instant,
}

impl TreeBuilder {
    pub fn new(config: BuilderConfig) -> Self {
        Self {
            config,
            state: State::Idle,
            cancelled: false,
            build: 0,
            root: "/".to_string(),
            root_established: false,
            nodes: HashMap::new(),
            since_flush: 0,
            last_emit: Instant::now(),
        }
    }

    pub fn handle(&mut self, command: BuildCommand) -> Option<Snapshot> {
        match command {
            BuildCommand::Init(path) => Some(self.init(&path)),
            BuildCommand::Entry(payload) => self.entry(payload),
            BuildCommand::Done => self.done(),
            BuildCommand::Cancel => {
                self.cancel();
                None
            }
        }
    }

    /// Starts a fresh build, discarding whatever a previous one collected.
    /// An unusable root path falls back to `/`.
    pub fn init(&mut self, path: &str) -> Snapshot {
        self.nodes.clear();
        self.cancelled = false;
        self.root_established = false;
        self.build += 1;
        self.root = paths::normalize(path).unwrap_or_else(|| "/".to_string());
        self.state = State::Collecting;
        self.since_flush = 0;
        self.last_emit = Instant::now();
        self.snapshot(SnapshotKind::Reset, None)
    }

    pub fn entry(&mut self, payload: EntryPayload) -> Option<Snapshot> {
        if self.cancelled || self.state != State::Collecting {
            return None;
        }
        let path = payload.normalized_path()?;
        if !paths::is_within(&path, &self.root) {
            return None;
        }

        let kind_known = payload.is_dir.is_some();
        match self.nodes.get_mut(&path) {
            Some(slot) => {
                slot.node.refine(&payload);
                slot.kind_known |= kind_known;
            }
            None => {
                let node = TreeNode::from_payload(path.clone(), &payload);
                self.nodes.insert(path.clone(), Slot::new(node, kind_known));
            }
        }

        if path == self.root {
            if !self.root_established {
                self.root_established = true;
                return Some(self.emit_partial());
            }
        } else {
            self.link_to_parent(&path);
        }

        self.since_flush += 1;
        let forced = self.since_flush >= self.config.flush_every.max(1);
        if forced || self.last_emit.elapsed() >= self.config.tick {
            return Some(self.emit_partial());
        }
        None
    }

    /// Finishes the build; always yields a well-formed tree unless cancelled.
    pub fn done(&mut self) -> Option<Snapshot> {
        if self.cancelled || self.state != State::Collecting {
            return None;
        }
        let tree = self.materialize_root();
        self.state = State::Idle;
        self.nodes.clear();
        Some(self.snapshot(SnapshotKind::Final, Some(tree)))
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    fn link_to_parent(&mut self, path: &str) {
        let Some(parent) = paths::parent(path) else {
            return;
        };
        match self.nodes.get_mut(path) {
            Some(slot) if !slot.linked => slot.linked = true,
            _ => return,
        }
        let parent_slot = self
            .nodes
            .entry(parent.clone())
            .or_insert_with(|| Slot::stub(&parent));
        if !parent_slot.kind_known {
            parent_slot.node.is_dir = true;
        }
        parent_slot.children.push(path.to_string());
    }

    fn emit_partial(&mut self) -> Snapshot {
        self.since_flush = 0;
        self.last_emit = Instant::now();
        let tree = self.materialize_root();
        self.snapshot(SnapshotKind::Partial, Some(tree))
    }

    fn snapshot(&self, kind: SnapshotKind, tree: Option<TreeNode>) -> Snapshot {
        Snapshot {
            build: self.build,
            root: self.root.clone(),
            kind,
            tree,
        }
    }

    /// The listed root is a directory unless a payload said otherwise.
    fn materialize_root(&self) -> TreeNode {
        match self.nodes.get(&self.root) {
            Some(slot) => {
                let mut root = self.materialize(&self.root);
                if !slot.kind_known {
                    root.is_dir = true;
                }
                root
            }
            None => TreeNode::placeholder_dir(&self.root),
        }
    }

    fn materialize(&self, path: &str) -> TreeNode {
        let Some(slot) = self.nodes.get(path) else {
            return TreeNode::placeholder_dir(path);
        };
        let mut node = slot.node.clone();
        if node.is_dir {
            node.children = slot
                .children
                .iter()
                .map(|child| self.materialize(child))
                .collect();
        }
        node
    }
}

#[derive(Debug, Clone, Error)]
pub enum BuilderError {
    #[error("failed to spawn tree builder thread: {0}")]
    Spawn(Arc<io::Error>),
    #[error("tree builder worker stopped")]
    Disconnected,
}

/// Handle to a [`TreeBuilder`] running on its own thread. Dropping the
/// handle closes the command channel, which stops the thread.
pub struct BuilderWorker {
    commands: std_mpsc::Sender<BuildCommand>,
    snapshots: mpsc::UnboundedReceiver<Snapshot>,
}

impl BuilderWorker {
    pub fn spawn(config: BuilderConfig) -> Result<Self, BuilderError> {
        let (command_tx, command_rx) = std_mpsc::channel::<BuildCommand>();
        let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();
        thread::Builder::new()
            .name("yadisk-tree-builder".to_string())
            .spawn(move || {
                let mut builder = TreeBuilder::new(config);
                while let Ok(command) = command_rx.recv() {
                    if let Some(snapshot) = builder.handle(command)
                        && snapshot_tx.send(snapshot).is_err()
                    {
                        break;
                    }
                }
            })
            .map_err(|err| BuilderError::Spawn(Arc::new(err)))?;
        Ok(Self {
            commands: command_tx,
            snapshots: snapshot_rx,
        })
    }

    pub fn send(&self, command: BuildCommand) -> Result<(), BuilderError> {
        self.commands
            .send(command)
            .map_err(|_| BuilderError::Disconnected)
    }

    pub fn init(&self, path: &str) -> Result<(), BuilderError> {
        self.send(BuildCommand::Init(path.to_string()))
    }

    pub fn entry(&self, payload: EntryPayload) -> Result<(), BuilderError> {
        self.send(BuildCommand::Entry(payload))
    }

    pub fn done(&self) -> Result<(), BuilderError> {
        self.send(BuildCommand::Done)
    }

    pub fn cancel(&self) -> Result<(), BuilderError> {
        self.send(BuildCommand::Cancel)
    }

    pub async fn next_snapshot(&mut self) -> Option<Snapshot> {
        self.snapshots.recv().await
    }

    pub fn try_next_snapshot(&mut self) -> Option<Snapshot> {
        self.snapshots.try_recv().ok()
    }

    /// Sends `done` and waits for the final snapshot, handing every earlier
    /// snapshot to `on_snapshot`.
    pub async fn finish(
        &mut self,
        mut on_snapshot: impl FnMut(Snapshot),
    ) -> Result<Snapshot, BuilderError> {
        self.done()?;
        while let Some(snapshot) = self.next_snapshot().await {
            if snapshot.kind == SnapshotKind::Final {
                return Ok(snapshot);
            }
            on_snapshot(snapshot);
        }
        Err(BuilderError::Disconnected)
    }
}
