//! Watch nodes: one primitive watch per directory, arranged as a tree.
//!
//! A recursive root owns a child node for every readable subdirectory.
//! Children are keyed by absolute path and owned by their parent; growing or
//! shrinking the tree is always "add leaf" or "prune subtree" on the
//! management thread.
//!
//! Directories that leave the tree, deleted or moved away, lose their node.
//! A directory that arrives under a name still held by a node replaces it, so
//! the tree never keeps following a directory that is no longer at its path.
//!
//! # Coverage guarantee
//!
//! Coverage is eventually consistent, not atomic. When a subdirectory is
//! created, its watch is attached only after the CREATE event has been
//! observed and processed, so changes made inside the new directory during
//! that window are not reported. The new node walks its own subtree on
//! start, which picks up directories created during the window, but not
//! file-level events that happened there.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::Sender;
use walkdir::WalkDir;

use super::error::WatchResult;
use super::event::{EventMask, EventType, WatchEvent};
use super::primitive::{PrimitiveHandle, PrimitiveWatcher, RawEvent, RawEventSink};
use super::registry::{Command, RootId};
use super::router::{Router, Subscription};

/// Identifies one node instance, so a late request for a directory that has
/// since been replaced under the same path is recognised.
pub(crate) type NodeSerial = u64;

/// State shared by every node of one root watch.
pub(crate) struct NodeContext {
    pub(crate) root_id: RootId,
    pub(crate) root: PathBuf,
    pub(crate) mask: EventMask,
    pub(crate) recursive: bool,
    pub(crate) follow_symlinks: bool,
    pub(crate) subscription: Arc<Subscription>,
    pub(crate) router: Router,
    pub(crate) commands: Sender<Command>,
    pub(crate) primitive: Arc<dyn PrimitiveWatcher>,
    pub(crate) next_serial: AtomicU64,
}

impl NodeContext {
    fn sink_for(self: &Arc<Self>, dir: &Path, serial: NodeSerial) -> RawEventSink {
        let context = Arc::clone(self);
        let dir = dir.to_path_buf();
        Arc::new(move |raw: RawEvent| context.on_raw_event(&dir, serial, raw))
    }

    /// Entry point for raw events; runs on the notification thread.
    ///
    /// Only masks, queues the delivery and queues follow-up tree work.
    pub(crate) fn on_raw_event(&self, dir: &Path, serial: NodeSerial, raw: RawEvent) {
        if !self.subscription.is_active() {
            return;
        }

        let source = match &raw.name {
            Some(name) => dir.join(name),
            None => dir.to_path_buf(),
        };

        // Housekeeping happens whatever the subscriber asked for
        self.track_departures(dir, serial, &raw, &source);

        let filtered = raw.code & self.mask.bits();
        if filtered == 0 {
            return;
        }

        let arrived = filtered == EventType::Create.code() || filtered == EventType::MovedTo.code();
        let attach = self.recursive && arrived && raw.name.is_some();
        let event = WatchEvent::new(filtered, self.root.clone(), source.clone());
        self.router.route(&self.subscription, event);

        if attach {
            self.request(Command::Attach {
                root_id: self.root_id,
                root: self.root.clone(),
                dir: source,
            });
        }
    }

    /// Queue a prune for a directory that left its place in the tree.
    ///
    /// A node's own DELETE_SELF or MOVE_SELF targets that node instance. The
    /// root keeps its node when moved. A child leaving (DELETE, MOVED_FROM)
    /// targets whatever node sits at that path, since the parent reports it
    /// before any later CREATE under the same name.
    fn track_departures(&self, dir: &Path, serial: NodeSerial, raw: &RawEvent, source: &Path) {
        let code = raw.code;
        let node = if raw.name.is_none() {
            let gone = code == EventType::DeleteSelf.code()
                || (code == EventType::MoveSelf.code() && dir != self.root);
            if !gone {
                return;
            }
            Some(serial)
        } else {
            let left = code == EventType::Delete.code() || code == EventType::MovedFrom.code();
            if !self.recursive || !left {
                return;
            }
            None
        };

        self.request(Command::Prune {
            root_id: self.root_id,
            root: self.root.clone(),
            dir: source.to_path_buf(),
            node,
        });
    }

    fn request(&self, command: Command) {
        if self.commands.send(command).is_err() {
            crate::debug_event!("watcher", "dropped", "management thread has stopped");
        }
    }
}

/// One directory under observation.
pub struct WatchNode {
    path: PathBuf,
    serial: NodeSerial,
    context: Arc<NodeContext>,
    handle: Option<Box<dyn PrimitiveHandle>>,
    children: HashMap<PathBuf, WatchNode>,
}

impl WatchNode {
    pub(crate) fn new(path: PathBuf, context: Arc<NodeContext>) -> Self {
        let serial = context.next_serial.fetch_add(1, Ordering::Relaxed);
        Self {
            path,
            serial,
            context,
            handle: None,
            children: HashMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this node's primitive watch is open.
    pub fn is_active(&self) -> bool {
        self.handle.is_some()
    }

    pub fn children(&self) -> impl Iterator<Item = &WatchNode> {
        self.children.values()
    }

    /// Number of nodes in this subtree with an open primitive watch.
    pub fn active_count(&self) -> usize {
        usize::from(self.is_active()) + self.children.values().map(WatchNode::active_count).sum::<usize>()
    }

    /// Directories covered by this subtree, sorted.
    pub fn directories(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        self.collect_directories(&mut dirs);
        dirs.sort();
        dirs
    }

    fn collect_directories(&self, out: &mut Vec<PathBuf>) {
        if self.is_active() {
            out.push(self.path.clone());
        }
        for child in self.children.values() {
            child.collect_directories(out);
        }
    }

    /// Open this node's primitive watch and, when recursive, cover every
    /// readable subdirectory that exists right now.
    ///
    /// Only a failure to watch this node's own path is an error. Failures
    /// below it are logged and leave that subtree uncovered.
    pub(crate) fn start(&mut self) -> WatchResult<()> {
        self.activate()?;
        if self.context.recursive && self.path.is_dir() {
            let attached = self.attach_subtree();
            if attached > 0 {
                crate::debug_event!(
                    "watcher",
                    "subtree",
                    "{}: {attached} directories",
                    self.path.display()
                );
            }
        }
        Ok(())
    }

    fn activate(&mut self) -> WatchResult<()> {
        if self.handle.is_none() {
            let sink = self.context.sink_for(&self.path, self.serial);
            self.handle = Some(self.context.primitive.open(&self.path, sink)?);
        }
        Ok(())
    }

    /// Close this node's watch and tear down every child.
    pub(crate) fn stop(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.close();
        }
        for (_, mut child) in self.children.drain() {
            child.stop();
        }
    }

    /// Walk the tree below this node, attaching a node per directory.
    ///
    /// The walk is pre-order, so a directory's parent is always in the tree
    /// before the directory itself is reached.
    fn attach_subtree(&mut self) -> usize {
        let walker = WalkDir::new(&self.path)
            .min_depth(1)
            .follow_links(self.context.follow_symlinks)
            .into_iter()
            .filter_entry(|entry| entry.file_type().is_dir() && is_readable(entry.path()));

        let mut attached = 0;
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("[watcher] walk error under {}: {e}", self.path.display());
                    continue;
                }
            };

            match self.insert_descendant(entry.path()) {
                Ok(true) => attached += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!("[watcher] {e}"),
            }
        }
        attached
    }

    /// Add a leaf for `dir` under its parent node without walking below it.
    fn insert_descendant(&mut self, dir: &Path) -> WatchResult<bool> {
        let context = Arc::clone(&self.context);
        let Some(parent) = dir.parent().and_then(|p| self.find_mut(p)) else {
            crate::debug_event!("watcher", "orphan", "{}", dir.display());
            return Ok(false);
        };
        if parent.children.contains_key(dir) {
            return Ok(false);
        }

        let mut child = WatchNode::new(dir.to_path_buf(), context);
        child.activate()?;
        parent.children.insert(dir.to_path_buf(), child);
        Ok(true)
    }

    /// Attach a directory that appeared after the tree was built.
    ///
    /// The new node walks its own subtree, so nested directories created
    /// before attachment are covered too. A node already sitting at `dir`
    /// watches whatever used that name before and is replaced. Returns the
    /// number of nodes added.
    pub(crate) fn attach(&mut self, dir: &Path) -> WatchResult<usize> {
        if !self.context.recursive || !self.is_active() {
            return Ok(0);
        }
        if !self.context.follow_symlinks && is_symlink(dir) {
            return Ok(0);
        }
        if !dir.is_dir() || !is_readable(dir) {
            crate::debug_event!("watcher", "not a readable directory", "{}", dir.display());
            return Ok(0);
        }

        let context = Arc::clone(&self.context);
        let Some(parent) = dir.parent().and_then(|p| self.find_mut(p)) else {
            return Ok(0);
        };
        if let Some(mut stale) = parent.children.remove(dir) {
            crate::debug_event!("watcher", "replacing", "{}", dir.display());
            stale.stop();
        }

        let mut child = WatchNode::new(dir.to_path_buf(), context);
        child.start()?;
        let added = child.active_count();
        parent.children.insert(dir.to_path_buf(), child);
        Ok(added)
    }

    /// Drop the node at `dir` together with its subtree.
    ///
    /// With `node` set, only that node instance is dropped. Pruning the root
    /// closes its own watch but keeps the node.
    pub(crate) fn prune(&mut self, dir: &Path, node: Option<NodeSerial>) -> bool {
        let matches = |found: &WatchNode| node.is_none_or(|serial| found.serial == serial);

        if dir == self.path {
            if !matches(self) {
                return false;
            }
            self.stop();
            return true;
        }

        let Some(parent) = dir.parent().and_then(|p| self.find_mut(p)) else {
            return false;
        };
        if !parent.children.get(dir).is_some_and(|child| matches(child)) {
            return false;
        }
        if let Some(mut child) = parent.children.remove(dir) {
            child.stop();
        }
        true
    }

    /// Locate the node for `dir` inside this subtree.
    fn find_mut(&mut self, dir: &Path) -> Option<&mut WatchNode> {
        if self.path == dir {
            return Some(self);
        }
        let rel = dir.strip_prefix(&self.path).ok()?;
        let first = rel.components().next()?;
        let next = self.path.join(first.as_os_str());
        self.children.get_mut(&next)?.find_mut(dir)
    }
}

impl std::fmt::Debug for WatchNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchNode")
            .field("path", &self.path)
            .field("active", &self.is_active())
            .field("children", &self.children.len())
            .finish()
    }
}

/// Read permission check: listing for directories, opening for files.
pub(crate) fn is_readable(path: &Path) -> bool {
    if path.is_dir() {
        fs::read_dir(path).is_ok()
    } else {
        fs::File::open(path).is_ok()
    }
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_symlink())
        .unwrap_or(false)
}
