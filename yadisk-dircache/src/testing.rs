//! In-memory transport for exercising the cache without HTTP.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::{self, BoxFuture};
use futures_util::stream;
use futures_util::{FutureExt, StreamExt};
use tokio::sync::oneshot;

use crate::transport::{DirectoryTransport, EntryStream, TransportError};
use crate::tree::EntryPayload;

pub(crate) struct Script {
    entries: Vec<EntryPayload>,
    error: Option<String>,
    gate: Option<oneshot::Receiver<()>>,
}

impl Script {
    pub(crate) fn listing(entries: Vec<EntryPayload>) -> Self {
        Self {
            entries,
            error: None,
            gate: None,
        }
    }

    pub(crate) fn failure(message: &str) -> Self {
        Self {
            entries: Vec::new(),
            error: Some(message.to_string()),
            gate: None,
        }
    }

    /// Holds the listing back until the returned sender fires.
    pub(crate) fn gated(mut self) -> (Self, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        self.gate = Some(rx);
        (self, tx)
    }
}

/// Directory `root` tagged with `rev`, containing the given child files.
pub(crate) fn listing(root: &str, rev: &str, children: &[&str]) -> Vec<EntryPayload> {
    let mut entries = vec![EntryPayload::dir(root).with_attribute("rev", rev)];
    entries.extend(
        children
            .iter()
            .map(|child| EntryPayload::file(format!("{}/{child}", root.trim_end_matches('/')))),
    );
    entries
}

#[derive(Default)]
pub(crate) struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    calls: Mutex<Vec<String>>,
    stats: Mutex<HashMap<String, EntryPayload>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn push(&self, path: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(script);
    }

    pub(crate) fn set_stat(&self, path: &str, payload: EntryPayload) {
        self.stats.lock().unwrap().insert(path.to_string(), payload);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub(crate) fn calls_for(&self, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| *call == path)
            .count()
    }
}

impl DirectoryTransport for ScriptedTransport {
    fn list_directory(&self, path: &str, _include_hidden: bool) -> EntryStream {
        self.calls.lock().unwrap().push(path.to_string());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(path)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Script::listing(vec![EntryPayload::dir(path)]));
        let Script {
            entries,
            error,
            gate,
        } = script;
        stream::once(async move {
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            let mut items: Vec<Result<EntryPayload, TransportError>> =
                entries.into_iter().map(Ok).collect();
            if let Some(message) = error {
                items.push(Err(TransportError::Other(message)));
            }
            stream::iter(items)
        })
        .flatten()
        .boxed()
    }

    fn stat(&self, path: &str) -> BoxFuture<'static, Result<EntryPayload, TransportError>> {
        let result = self
            .stats
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| TransportError::Other(format!("no such entry: {path}")));
        future::ready(result).boxed()
    }
}

pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
