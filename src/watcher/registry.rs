//! Watch registry: one root watch per path, owned by the management thread.
//!
//! Every mutation of the root map and of the node trees happens inside
//! [`WatchRegistry::run`], fed by [`Command`]s. Other threads only ever read
//! the shared path mirror.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use tokio::sync::oneshot;

use super::error::{WatchError, WatchResult};
use super::node::{NodeContext, NodeSerial, WatchNode, is_readable};
use super::primitive::PrimitiveBackend;
use super::router::{Router, Subscription};
use super::service::WatchOptions;

/// Distinguishes successive root watches registered under the same path.
pub(crate) type RootId = u64;

/// Work items for the management thread.
pub(crate) enum Command {
    Start {
        path: PathBuf,
        options: WatchOptions,
        subscription: Arc<Subscription>,
        reply: oneshot::Sender<WatchResult<PathBuf>>,
    },
    Stop {
        path: PathBuf,
        reply: oneshot::Sender<WatchResult<()>>,
    },
    StopAll {
        reply: oneshot::Sender<usize>,
    },
    Directories {
        path: PathBuf,
        reply: oneshot::Sender<WatchResult<Vec<PathBuf>>>,
    },
    /// A recursive node saw `dir` appear (CREATE or MOVED_TO).
    Attach {
        root_id: RootId,
        root: PathBuf,
        dir: PathBuf,
    },
    /// `dir` was deleted or moved away. `node` limits the prune to one node
    /// instance.
    Prune {
        root_id: RootId,
        root: PathBuf,
        dir: PathBuf,
        node: Option<NodeSerial>,
    },
    Shutdown,
}

struct RootWatch {
    id: RootId,
    node: WatchNode,
    subscription: Arc<Subscription>,
}

impl RootWatch {
    /// Cancel delivery first so nothing reaches the callback once this returns.
    fn stop(mut self) {
        self.subscription.cancel();
        self.node.stop();
    }
}

pub(crate) struct WatchRegistry {
    roots: HashMap<PathBuf, RootWatch>,
    next_id: RootId,
    backend: Arc<dyn PrimitiveBackend>,
    router: Router,
    commands: Sender<Command>,
    follow_symlinks: bool,
    paths: Arc<RwLock<BTreeSet<PathBuf>>>,
}

impl WatchRegistry {
    pub(crate) fn new(
        backend: Arc<dyn PrimitiveBackend>,
        router: Router,
        commands: Sender<Command>,
        follow_symlinks: bool,
    ) -> Self {
        Self {
            roots: HashMap::new(),
            next_id: 1,
            backend,
            router,
            commands,
            follow_symlinks,
            paths: Arc::new(RwLock::new(BTreeSet::new())),
        }
    }

    /// Read-only view of the registered root paths, shared with other threads.
    pub(crate) fn paths(&self) -> Arc<RwLock<BTreeSet<PathBuf>>> {
        Arc::clone(&self.paths)
    }

    /// Register a root watch, replacing any existing watch on `path`.
    ///
    /// Validation failures leave an existing watch untouched. Once validation
    /// passes the old watch is gone even if activating the new one fails.
    pub(crate) fn start(
        &mut self,
        path: PathBuf,
        options: WatchOptions,
        subscription: Arc<Subscription>,
    ) -> WatchResult<PathBuf> {
        if !path.exists() {
            return Err(WatchError::PathNotFound { path });
        }
        if !is_readable(&path) {
            return Err(WatchError::Unreadable { path });
        }

        if let Some(previous) = self.roots.remove(&path) {
            crate::debug_event!("registry", "replacing", "{}", path.display());
            previous.stop();
            self.paths.write().remove(&path);
        }

        let id = self.next_id;
        self.next_id += 1;

        let primitive = match self.backend.connect(&path) {
            Ok(primitive) => primitive,
            Err(e) => {
                subscription.cancel();
                tracing::warn!("[registry] {e}");
                return Err(e);
            }
        };

        let context = Arc::new(NodeContext {
            root_id: id,
            root: path.clone(),
            mask: options.mask,
            recursive: options.recursive && path.is_dir(),
            follow_symlinks: self.follow_symlinks,
            subscription: Arc::clone(&subscription),
            router: self.router.clone(),
            commands: self.commands.clone(),
            primitive,
            next_serial: AtomicU64::new(0),
        });

        let mut node = WatchNode::new(path.clone(), context);
        if let Err(e) = node.start() {
            subscription.cancel();
            node.stop();
            tracing::warn!("[registry] {e}");
            return Err(e);
        }

        crate::log_event!(
            "registry",
            "started",
            "{} (recursive: {}, mask: {:#06x}, {} directories)",
            path.display(),
            options.recursive,
            options.mask.bits(),
            node.active_count()
        );

        self.roots.insert(
            path.clone(),
            RootWatch {
                id,
                node,
                subscription,
            },
        );
        self.paths.write().insert(path.clone());
        Ok(path)
    }

    pub(crate) fn stop(&mut self, path: &Path) -> WatchResult<()> {
        let Some(root) = self.roots.remove(path) else {
            return Err(WatchError::NotWatching {
                path: path.to_path_buf(),
            });
        };
        root.stop();
        self.paths.write().remove(path);
        crate::log_event!("registry", "stopped", "{}", path.display());
        Ok(())
    }

    /// Stop every root watch. Returns how many were stopped.
    pub(crate) fn stop_all(&mut self) -> usize {
        let count = self.roots.len();
        for (_, root) in self.roots.drain() {
            root.stop();
        }
        self.paths.write().clear();
        if count > 0 {
            crate::log_event!("registry", "stopped all", "{count} watches");
        }
        count
    }

    pub(crate) fn directories(&self, path: &Path) -> WatchResult<Vec<PathBuf>> {
        self.roots
            .get(path)
            .map(|root| root.node.directories())
            .ok_or_else(|| WatchError::NotWatching {
                path: path.to_path_buf(),
            })
    }

    /// Requests from a stopped or replaced root are dropped here.
    fn live_root(&mut self, root_id: RootId, root: &Path) -> Option<&mut WatchNode> {
        self.roots
            .get_mut(root)
            .filter(|watch| watch.id == root_id)
            .map(|watch| &mut watch.node)
    }

    fn attach(&mut self, root_id: RootId, root: &Path, dir: &Path) {
        let Some(node) = self.live_root(root_id, root) else {
            crate::debug_event!("registry", "stale attach", "{}", dir.display());
            return;
        };
        match node.attach(dir) {
            Ok(0) => {}
            Ok(added) => {
                crate::debug_event!("registry", "attached", "{} ({added} directories)", dir.display())
            }
            Err(e) => tracing::warn!("[registry] attach failed: {e}"),
        }
    }

    fn prune(&mut self, root_id: RootId, root: &Path, dir: &Path, node: Option<NodeSerial>) {
        let Some(tree) = self.live_root(root_id, root) else {
            return;
        };
        if tree.prune(dir, node) {
            crate::debug_event!("registry", "pruned", "{}", dir.display());
        }
    }

    /// Apply one command. Returns false when the loop should exit.
    pub(crate) fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Start {
                path,
                options,
                subscription,
                reply,
            } => {
                let _ = reply.send(self.start(path, options, subscription));
            }
            Command::Stop { path, reply } => {
                let _ = reply.send(self.stop(&path));
            }
            Command::StopAll { reply } => {
                let _ = reply.send(self.stop_all());
            }
            Command::Directories { path, reply } => {
                let _ = reply.send(self.directories(&path));
            }
            Command::Attach { root_id, root, dir } => self.attach(root_id, &root, &dir),
            Command::Prune {
                root_id,
                root,
                dir,
                node,
            } => self.prune(root_id, &root, &dir, node),
            Command::Shutdown => return false,
        }
        true
    }

    /// Management loop. On exit all watches are stopped and the delivery
    /// thread is told to finish.
    pub(crate) fn run(mut self, rx: Receiver<Command>) {
        for command in rx.iter() {
            if !self.handle(command) {
                break;
            }
        }
        self.stop_all();
        self.router.shutdown();
        crate::debug_event!("registry", "stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::event::{EventMask, EventType};
    use crate::watcher::primitive::testing::RecordingPrimitive;
    use crate::watcher::router::Dispatch;
    use crossbeam_channel::unbounded;
    use std::fs;
    use tempfile::TempDir;

    struct Harness {
        registry: WatchRegistry,
        primitive: Arc<RecordingPrimitive>,
        commands: Receiver<Command>,
        deliveries: Receiver<Dispatch>,
    }

    fn harness() -> Harness {
        let primitive = RecordingPrimitive::new();
        let (router, deliveries) = Router::detached();
        let (tx, commands) = unbounded();
        let registry = WatchRegistry::new(Arc::new(Arc::clone(&primitive)), router, tx, false);
        Harness {
            registry,
            primitive,
            commands,
            deliveries,
        }
    }

    fn subscription(path: &Path) -> Arc<Subscription> {
        Subscription::new(path, Box::new(|_| {}))
    }

    fn recursive() -> WatchOptions {
        WatchOptions::default().recursive(true)
    }

    /// Feed queued attach/prune requests back into the registry.
    fn pump(h: &mut Harness) {
        while let Ok(command) = h.commands.try_recv() {
            h.registry.handle(command);
        }
    }

    fn delivered_sources(h: &Harness) -> Vec<(PathBuf, EventType)> {
        h.deliveries
            .try_iter()
            .filter_map(|d| match d {
                Dispatch::Event { subscription, event } if subscription.is_active() => {
                    Some((event.source.clone(), event.kind()))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_start_validates_path() {
        let mut h = harness();
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("missing");

        let err = h
            .registry
            .start(missing.clone(), WatchOptions::default(), subscription(&missing))
            .unwrap_err();
        assert_eq!(err, WatchError::PathNotFound { path: missing });
        assert!(h.registry.paths().read().is_empty());
    }

    #[test]
    fn test_start_and_stop() {
        let mut h = harness();
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();

        let id = h
            .registry
            .start(root.clone(), WatchOptions::default(), subscription(&root))
            .unwrap();
        assert_eq!(id, root);
        assert!(h.registry.paths().read().contains(&root));

        h.registry.stop(&root).unwrap();
        assert!(h.registry.paths().read().is_empty());
        assert!(h.primitive.open_paths().is_empty());

        let err = h.registry.stop(&root).unwrap_err();
        assert!(matches!(err, WatchError::NotWatching { .. }));
        assert_eq!(err.to_string(), format!("No observer found for path: {}", root.display()));
    }

    #[test]
    fn test_restart_replaces_previous_watch() {
        let mut h = harness();
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();

        let first = subscription(&root);
        let second = subscription(&root);
        h.registry
            .start(root.clone(), WatchOptions::default(), Arc::clone(&first))
            .unwrap();
        h.registry
            .start(root.clone(), WatchOptions::default(), Arc::clone(&second))
            .unwrap();

        assert!(!first.is_active());
        assert!(second.is_active());
        assert_eq!(h.registry.paths().read().len(), 1);
        assert_eq!(h.primitive.open_paths(), vec![root.clone()]);
        assert_eq!(h.primitive.opened_total(), 2);
    }

    #[test]
    fn test_failed_validation_keeps_existing_watch() {
        let mut h = harness();
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("w");
        fs::create_dir(&root).unwrap();

        let sub = subscription(&root);
        h.registry
            .start(root.clone(), WatchOptions::default(), Arc::clone(&sub))
            .unwrap();

        // A second request for the same key that fails validation
        fs::remove_dir(&root).unwrap();
        assert!(h.registry.start(root.clone(), WatchOptions::default(), subscription(&root)).is_err());
        assert!(sub.is_active());
        assert!(h.registry.paths().read().contains(&root));
    }

    #[test]
    fn test_activation_failure_is_reported() {
        let mut h = harness();
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        h.primitive.fail_on(&root);

        let sub = subscription(&root);
        let err = h
            .registry
            .start(root.clone(), WatchOptions::default(), Arc::clone(&sub))
            .unwrap_err();
        assert!(matches!(err, WatchError::ActivationFailure { .. }));
        assert!(!sub.is_active());
        assert!(h.registry.paths().read().is_empty());
    }

    #[test]
    fn test_dynamic_attachment_through_commands() {
        let mut h = harness();
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        h.registry
            .start(root.clone(), recursive(), subscription(&root))
            .unwrap();

        fs::create_dir(root.join("b")).unwrap();
        assert!(h.primitive.emit(&root, EventType::Create, Some("b")));
        pump(&mut h);
        assert!(h.primitive.is_open(&root.join("b")));

        fs::write(root.join("b/file.txt"), b"x").unwrap();
        assert!(h.primitive.emit(&root.join("b"), EventType::Create, Some("file.txt")));
        pump(&mut h);

        let sources = delivered_sources(&h);
        assert_eq!(
            sources,
            vec![
                (root.join("b"), EventType::Create),
                (root.join("b/file.txt"), EventType::Create),
            ]
        );
        assert_eq!(
            h.registry.directories(&root).unwrap(),
            vec![root.clone(), root.join("b")]
        );
    }

    #[test]
    fn test_attach_for_stopped_root_is_ignored() {
        let mut h = harness();
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        h.registry
            .start(root.clone(), recursive(), subscription(&root))
            .unwrap();

        fs::create_dir(root.join("late")).unwrap();
        h.primitive.emit(&root, EventType::Create, Some("late"));
        h.registry.stop(&root).unwrap();
        pump(&mut h);

        assert!(h.primitive.open_paths().is_empty());
    }

    #[test]
    fn test_attach_for_replaced_root_is_ignored() {
        let mut h = harness();
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        h.registry
            .start(root.clone(), recursive(), subscription(&root))
            .unwrap();

        fs::create_dir(root.join("late")).unwrap();
        h.primitive.emit(&root, EventType::Create, Some("late"));

        // Replacement is non-recursive; the queued request belongs to the old tree
        h.registry
            .start(root.clone(), WatchOptions::default(), subscription(&root))
            .unwrap();
        pump(&mut h);

        assert_eq!(h.primitive.open_paths(), vec![root]);
    }

    #[test]
    fn test_delete_self_prunes_child_node() {
        let mut h = harness();
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        fs::create_dir_all(root.join("a/b")).unwrap();
        h.registry
            .start(
                root.clone(),
                recursive().mask(EventMask::CREATE),
                subscription(&root),
            )
            .unwrap();
        assert_eq!(h.primitive.open_paths().len(), 3);

        fs::remove_dir_all(root.join("a")).unwrap();
        h.primitive.emit(&root.join("a"), EventType::DeleteSelf, None);
        pump(&mut h);

        assert_eq!(h.primitive.open_paths(), vec![root.clone()]);
        assert!(h.registry.paths().read().contains(&root));
    }

    #[test]
    fn test_directory_moved_away_and_recreated_is_rewatched() {
        let mut h = harness();
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("r");
        fs::create_dir_all(root.join("a")).unwrap();
        h.registry
            .start(root.clone(), recursive(), subscription(&root))
            .unwrap();

        fs::rename(root.join("a"), temp.path().join("elsewhere")).unwrap();
        h.primitive.emit(&root, EventType::MovedFrom, Some("a"));
        h.primitive.emit(&root.join("a"), EventType::MoveSelf, None);
        pump(&mut h);
        assert_eq!(h.registry.directories(&root).unwrap(), vec![root.clone()]);

        fs::create_dir(root.join("a")).unwrap();
        h.primitive.emit(&root, EventType::Create, Some("a"));
        pump(&mut h);
        assert_eq!(
            h.registry.directories(&root).unwrap(),
            vec![root.clone(), root.join("a")]
        );

        fs::write(root.join("a/new.txt"), b"x").unwrap();
        assert!(h.primitive.emit(&root.join("a"), EventType::Create, Some("new.txt")));
        assert!(delivered_sources(&h).contains(&(root.join("a/new.txt"), EventType::Create)));
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_path_is_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let mut h = harness();
        let temp = TempDir::new().unwrap();
        let locked = temp.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // Permission bits do not stop a privileged user
        if fs::read_dir(&locked).is_ok() {
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let result = h
            .registry
            .start(locked.clone(), WatchOptions::default(), subscription(&locked));
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(result, Err(WatchError::Unreadable { path: locked }));
        assert!(h.registry.paths().read().is_empty());
        assert!(h.primitive.open_paths().is_empty());
    }

    #[test]
    fn test_stop_all_and_shutdown() {
        let mut h = harness();
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        fs::create_dir(&a).unwrap();
        fs::create_dir(&b).unwrap();

        h.registry
            .start(a.clone(), WatchOptions::default(), subscription(&a))
            .unwrap();
        h.registry
            .start(b.clone(), WatchOptions::default(), subscription(&b))
            .unwrap();
        assert_eq!(h.registry.stop_all(), 2);
        assert!(h.primitive.open_paths().is_empty());
        assert!(h.registry.paths().read().is_empty());

        assert!(!h.registry.handle(Command::Shutdown));
    }

    #[test]
    fn test_run_loop_replies_and_exits() {
        let primitive = RecordingPrimitive::new();
        let (router, deliveries) = Router::detached();
        let (tx, rx) = unbounded();
        let registry = WatchRegistry::new(Arc::new(Arc::clone(&primitive)), router, tx.clone(), false);
        let paths = registry.paths();
        let worker = std::thread::spawn(move || registry.run(rx));

        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        let (reply, response) = oneshot::channel();
        tx.send(Command::Start {
            path: root.clone(),
            options: WatchOptions::default(),
            subscription: subscription(&root),
            reply,
        })
        .unwrap();
        assert_eq!(response.blocking_recv().unwrap().unwrap(), root);
        assert!(paths.read().contains(&root));

        tx.send(Command::Shutdown).unwrap();
        worker.join().unwrap();

        assert!(paths.read().is_empty());
        assert!(primitive.open_paths().is_empty());
        assert!(matches!(deliveries.try_recv(), Ok(Dispatch::Shutdown)));
    }
}
