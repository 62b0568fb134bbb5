//! Single-directory change notification.
//!
//! A primitive watch covers exactly one directory (or file) and reports
//! `(event code, child name)` pairs. Recursion is built on top of this by
//! [`WatchNode`](super::node::WatchNode), never delegated to the backend.
//!
//! # Backend sharing
//!
//! Each root watch asks the [`PrimitiveBackend`] for one [`PrimitiveWatcher`]
//! and every directory of that root is opened through it. With
//! [`NotifyPrimitive`] that is one OS watcher per root (one inotify instance on
//! Linux), so `fs.inotify.max_user_instances` bounds concurrent roots while
//! `fs.inotify.max_user_watches` bounds directories.
//!
//! An OS watcher reports paths, not which of its watches saw the event, so a
//! watcher is never shared between roots. Inside one root the path decides
//! which directory an event belongs to; see [`RouteTable`].
//!
//! # Kernel coverage
//!
//! On Linux the notify backend never subscribes to ACCESS or CLOSE_NOWRITE.
//! Those bits are accepted in masks but nothing is reported for them; see
//! [`NotifyPrimitive::UNREPORTED`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;

use super::error::{WatchError, WatchResult};
use super::event::{EventMask, EventType};

/// Unfiltered event reported by a primitive watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// Event code (one bit of the event enumeration).
    pub code: u32,
    /// Name of the child inside the watched directory, `None` when the event
    /// concerns the watched path itself.
    pub name: Option<PathBuf>,
}

impl RawEvent {
    pub fn new(kind: EventType, name: Option<PathBuf>) -> Self {
        Self {
            code: kind.code(),
            name,
        }
    }
}

/// Receiver for raw events. Runs on the backend's notification thread, so it
/// must return quickly.
pub type RawEventSink = Arc<dyn Fn(RawEvent) + Send + Sync + 'static>;

/// Active primitive watch. Closing is idempotent and also happens on drop.
pub trait PrimitiveHandle: Send {
    fn close(&mut self);
}

/// Capability to open single-directory watches.
pub trait PrimitiveWatcher: Send + Sync + 'static {
    fn open(&self, path: &Path, sink: RawEventSink) -> WatchResult<Box<dyn PrimitiveHandle>>;
}

/// Source of primitive watchers, one per root watch.
pub trait PrimitiveBackend: Send + Sync + 'static {
    /// Watcher serving every directory of the root watch on `root`.
    fn connect(&self, root: &Path) -> WatchResult<Arc<dyn PrimitiveWatcher>>;
}

/// Backend built on `notify`, watching each directory non-recursively.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotifyPrimitive;

impl NotifyPrimitive {
    /// Mask bits this backend never reports.
    #[cfg(target_os = "linux")]
    pub const UNREPORTED: EventMask = EventMask::ACCESS.union(EventMask::CLOSE_NOWRITE);
    #[cfg(not(target_os = "linux"))]
    pub const UNREPORTED: EventMask = EventMask::empty();
}

impl PrimitiveBackend for NotifyPrimitive {
    fn connect(&self, root: &Path) -> WatchResult<Arc<dyn PrimitiveWatcher>> {
        Ok(Arc::new(NotifyWatcher::new(root)?))
    }
}

/// One OS watcher shared by every directory of a root watch.
struct NotifyWatcher {
    shared: Arc<Shared>,
}

struct Shared {
    backend: Mutex<Backend>,
    routes: Arc<RouteTable>,
}

struct Backend {
    watcher: RecommendedWatcher,
    /// Open handles per absolute path. The OS watch goes when this hits zero.
    watched: HashMap<PathBuf, usize>,
}

impl NotifyWatcher {
    fn new(root: &Path) -> WatchResult<Self> {
        let routes = Arc::new(RouteTable::default());
        let table = Arc::clone(&routes);

        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => table.dispatch(&event),
            Err(e) => tracing::warn!("[watcher] notification error: {e}"),
        })
        .map_err(|e| WatchError::activation(root, e))?;

        Ok(Self {
            shared: Arc::new(Shared {
                backend: Mutex::new(Backend {
                    watcher,
                    watched: HashMap::new(),
                }),
                routes,
            }),
        })
    }
}

impl PrimitiveWatcher for NotifyWatcher {
    fn open(&self, path: &Path, sink: RawEventSink) -> WatchResult<Box<dyn PrimitiveHandle>> {
        let key = absolute(path);
        // Registered first so nothing reported right after the OS watch exists is lost
        let id = self.shared.routes.insert(path, sink);

        // Never holds the route lock here; the notification thread needs it
        let mut backend = self.shared.backend.lock();
        if let Err(e) = backend.watcher.watch(&key, RecursiveMode::NonRecursive) {
            drop(backend);
            self.shared.routes.remove(id);
            return Err(WatchError::activation(path, e));
        }
        *backend.watched.entry(key.clone()).or_insert(0) += 1;

        Ok(Box::new(NotifyHandle {
            id,
            key,
            shared: Arc::clone(&self.shared),
            closed: false,
        }))
    }
}

struct NotifyHandle {
    id: RouteId,
    key: PathBuf,
    shared: Arc<Shared>,
    closed: bool,
}

impl PrimitiveHandle for NotifyHandle {
    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shared.routes.remove(self.id);

        let mut backend = self.shared.backend.lock();
        let remaining = match backend.watched.get_mut(&self.key) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            backend.watched.remove(&self.key);
            // The backend drops watches of deleted or moved directories itself
            if let Err(e) = backend.watcher.unwatch(&self.key) {
                crate::debug_event!("watcher", "unwatch", "{}: {e}", self.key.display());
            }
        }
    }
}

impl Drop for NotifyHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Spelling the backend uses when reporting paths under `path`.
fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

type RouteId = u64;

struct Route {
    keys: Vec<PathBuf>,
    sink: RawEventSink,
    /// Set once the directory reported its own removal.
    removed: bool,
}

#[derive(Default)]
struct Routes {
    next_id: RouteId,
    routes: HashMap<RouteId, Route>,
    by_path: HashMap<PathBuf, Vec<RouteId>>,
}

impl Routes {
    fn at(&self, path: &Path) -> &[RouteId] {
        self.by_path.get(path).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Which watched directory a backend event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attribution {
    /// Reported by the parent directory's watch.
    Child(EventType),
    /// Reported by the path's own watch.
    OwnPath(EventType),
    /// The parent's watch when the parent is watched, else the path's own.
    Nearest(EventType),
    /// DELETE from the parent or DELETE_SELF from the path itself.
    Removal,
}

/// Maps paths reported by one OS watcher back to per-directory sinks.
///
/// A directory and its parent both see some changes to the directory (its
/// removal, its attributes). The OS reports each sighting as a separate event
/// with the same path, so every backend event resolves to exactly one watch.
/// Removals resolve to the path's own watch first (DELETE_SELF) and to the
/// parent on the next sighting (DELETE).
#[derive(Default)]
pub(crate) struct RouteTable {
    inner: Mutex<Routes>,
}

impl RouteTable {
    /// Register `sink` for events under `path`. Backends may report canonical
    /// paths, so both spellings are accepted.
    pub(crate) fn insert(&self, path: &Path, sink: RawEventSink) -> RouteId {
        let key = absolute(path);
        let mut keys = vec![key.clone()];
        if let Ok(canonical) = key.canonicalize() {
            if canonical != key {
                keys.push(canonical);
            }
        }
        self.insert_keys(keys, sink)
    }

    fn insert_keys(&self, keys: Vec<PathBuf>, sink: RawEventSink) -> RouteId {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        for key in &keys {
            inner.by_path.entry(key.clone()).or_default().push(id);
        }
        inner.routes.insert(
            id,
            Route {
                keys,
                sink,
                removed: false,
            },
        );
        id
    }

    pub(crate) fn remove(&self, id: RouteId) {
        let mut inner = self.inner.lock();
        let Some(route) = inner.routes.remove(&id) else {
            return;
        };
        for key in route.keys {
            if let Some(ids) = inner.by_path.get_mut(&key) {
                ids.retain(|other| *other != id);
                if ids.is_empty() {
                    inner.by_path.remove(&key);
                }
            }
        }
    }

    /// Hand one backend event to the sinks it belongs to.
    pub(crate) fn dispatch(&self, event: &Event) {
        for (sink, raw) in self.resolve(event) {
            sink(raw);
        }
    }

    /// Sinks are collected under the lock and called after it is released.
    fn resolve(&self, event: &Event) -> Vec<(RawEventSink, RawEvent)> {
        let mut inner = self.inner.lock();
        let mut out = Vec::new();

        for path in &event.paths {
            let Some(attribution) = attribute(event, path, !inner.at(path).is_empty()) else {
                tracing::trace!("[watcher] unclassified event {:?} for {}", event.kind, path.display());
                continue;
            };

            let parent = path.parent().unwrap_or(path);
            let (ids, raw) = match attribution {
                Attribution::Child(kind) => (inner.at(parent).to_vec(), child_event(kind, path)),
                Attribution::OwnPath(kind) => (inner.at(path).to_vec(), RawEvent::new(kind, None)),
                Attribution::Nearest(kind) if !inner.at(parent).is_empty() => {
                    (inner.at(parent).to_vec(), child_event(kind, path))
                }
                Attribution::Nearest(kind) => (inner.at(path).to_vec(), RawEvent::new(kind, None)),
                Attribution::Removal => {
                    let own: Vec<RouteId> = inner
                        .at(path)
                        .iter()
                        .copied()
                        .filter(|id| inner.routes.get(id).is_some_and(|r| !r.removed))
                        .collect();
                    if own.is_empty() {
                        (inner.at(parent).to_vec(), child_event(EventType::Delete, path))
                    } else {
                        for id in &own {
                            if let Some(route) = inner.routes.get_mut(id) {
                                route.removed = true;
                            }
                        }
                        (own, RawEvent::new(EventType::DeleteSelf, None))
                    }
                }
            };

            for id in ids {
                if let Some(route) = inner.routes.get(&id) {
                    out.push((Arc::clone(&route.sink), raw.clone()));
                }
            }
        }
        out
    }
}

fn child_event(kind: EventType, path: &Path) -> RawEvent {
    RawEvent::new(kind, path.file_name().map(PathBuf::from))
}

/// Classify a backend event for one of its paths. `watched` tells whether the
/// path is itself a watched directory.
fn attribute(event: &Event, path: &Path, watched: bool) -> Option<Attribution> {
    let attribution = match &event.kind {
        EventKind::Create(_) => Attribution::Child(EventType::Create),
        EventKind::Remove(_) => Attribution::Removal,
        // The same rename is also reported as separate From and To events
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => return None,
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            // MOVED_FROM carries the rename cookie, MOVE_SELF does not
            if watched && event.tracker().is_none() {
                Attribution::OwnPath(EventType::MoveSelf)
            } else {
                Attribution::Child(EventType::MovedFrom)
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Attribution::Child(EventType::MovedTo),
        EventKind::Modify(ModifyKind::Name(_)) => {
            if path.exists() {
                Attribution::Child(EventType::MovedTo)
            } else {
                Attribution::Child(EventType::MovedFrom)
            }
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => Attribution::Nearest(EventType::Attrib),
        EventKind::Modify(_) => Attribution::Nearest(EventType::Modify),
        EventKind::Access(AccessKind::Open(_)) => Attribution::Nearest(EventType::Open),
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
            Attribution::Nearest(EventType::CloseWrite)
        }
        EventKind::Access(AccessKind::Close(_)) => Attribution::Nearest(EventType::CloseNowrite),
        EventKind::Access(_) => Attribution::Nearest(EventType::Access),
        EventKind::Any | EventKind::Other => return None,
    };
    Some(attribution)
}


#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};

    type Seen = Arc<Mutex<Vec<RawEvent>>>;

    fn recording_sink() -> (RawEventSink, Seen) {
        let seen: Seen = Arc::default();
        let log = Arc::clone(&seen);
        (Arc::new(move |raw: RawEvent| log.lock().push(raw)), seen)
    }

    /// Routes for `/w` and its watched subdirectory `/w/sub`.
    fn table() -> (RouteTable, Seen, Seen) {
        let table = RouteTable::default();
        let (root_sink, root) = recording_sink();
        let (sub_sink, sub) = recording_sink();
        table.insert_keys(vec![PathBuf::from("/w")], root_sink);
        table.insert_keys(vec![PathBuf::from("/w/sub")], sub_sink);
        (table, root, sub)
    }

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        paths
            .iter()
            .fold(Event::new(kind), |ev, p| ev.add_path(PathBuf::from(p)))
    }

    fn named(kind: EventType, name: &str) -> RawEvent {
        RawEvent::new(kind, Some(PathBuf::from(name)))
    }

    #[test]
    fn test_create_goes_to_parent_only() {
        let (table, root, sub) = table();
        table.dispatch(&event(EventKind::Create(CreateKind::File), &["/w/new.txt"]));
        table.dispatch(&event(EventKind::Create(CreateKind::Folder), &["/w/sub/inner"]));

        assert_eq!(*root.lock(), vec![named(EventType::Create, "new.txt")]);
        assert_eq!(*sub.lock(), vec![named(EventType::Create, "inner")]);
    }

    #[test]
    fn test_rename_reported_once() {
        let (table, root, _sub) = table();
        let from = event(EventKind::Modify(ModifyKind::Name(RenameMode::From)), &["/w/old.txt"])
            .set_tracker(7);
        let to = event(EventKind::Modify(ModifyKind::Name(RenameMode::To)), &["/w/new.txt"])
            .set_tracker(7);
        let both = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/w/old.txt", "/w/new.txt"],
        )
        .set_tracker(7);

        table.dispatch(&from);
        table.dispatch(&to);
        table.dispatch(&both);

        assert_eq!(
            *root.lock(),
            vec![
                named(EventType::MovedFrom, "old.txt"),
                named(EventType::MovedTo, "new.txt"),
            ]
        );
    }

    #[test]
    fn test_watched_directory_moving_away() {
        let (table, root, sub) = table();
        // Parent sees MOVED_FROM with the cookie, the directory sees MOVE_SELF
        table.dispatch(
            &event(EventKind::Modify(ModifyKind::Name(RenameMode::From)), &["/w/sub"]).set_tracker(3),
        );
        table.dispatch(&event(EventKind::Modify(ModifyKind::Name(RenameMode::From)), &["/w/sub"]));

        assert_eq!(*root.lock(), vec![named(EventType::MovedFrom, "sub")]);
        assert_eq!(*sub.lock(), vec![RawEvent::new(EventType::MoveSelf, None)]);
    }

    #[test]
    fn test_removal_of_watched_directory() {
        let (table, root, sub) = table();
        let removal = event(EventKind::Remove(RemoveKind::Folder), &["/w/sub"]);
        table.dispatch(&removal);
        table.dispatch(&removal);

        assert_eq!(*sub.lock(), vec![RawEvent::new(EventType::DeleteSelf, None)]);
        assert_eq!(*root.lock(), vec![named(EventType::Delete, "sub")]);

        table.dispatch(&event(EventKind::Remove(RemoveKind::File), &["/w/plain.txt"]));
        assert_eq!(root.lock().last(), Some(&named(EventType::Delete, "plain.txt")));
    }

    #[test]
    fn test_removal_of_unnested_root_is_delete_self() {
        let table = RouteTable::default();
        let (sink, seen) = recording_sink();
        table.insert_keys(vec![PathBuf::from("/w")], sink);

        table.dispatch(&event(EventKind::Remove(RemoveKind::Any), &["/w"]));
        assert_eq!(*seen.lock(), vec![RawEvent::new(EventType::DeleteSelf, None)]);
    }

    #[test]
    fn test_own_changes_resolve_to_nearest_watch() {
        let (table, root, sub) = table();
        table.dispatch(&event(
            EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)),
            &["/w/sub"],
        ));
        // The root's parent is not watched, so the root itself reports it
        table.dispatch(&event(
            EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)),
            &["/w"],
        ));

        assert_eq!(
            *root.lock(),
            vec![named(EventType::Attrib, "sub"), RawEvent::new(EventType::Attrib, None)]
        );
        assert!(sub.lock().is_empty());
    }

    #[test]
    fn test_access_and_modify_variants() {
        let (table, root, _sub) = table();
        let kinds = [
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            EventKind::Access(AccessKind::Open(AccessMode::Any)),
            EventKind::Access(AccessKind::Close(AccessMode::Write)),
            EventKind::Access(AccessKind::Close(AccessMode::Read)),
            EventKind::Access(AccessKind::Read),
        ];
        for kind in kinds {
            table.dispatch(&event(kind, &["/w/a"]));
        }

        let codes: Vec<u32> = root.lock().iter().map(|raw| raw.code).collect();
        assert_eq!(
            codes,
            vec![
                EventType::Modify.code(),
                EventType::Open.code(),
                EventType::CloseWrite.code(),
                EventType::CloseNowrite.code(),
                EventType::Access.code(),
            ]
        );
    }

    #[test]
    fn test_unwatched_and_foreign_paths_ignored() {
        let (table, root, sub) = table();
        table.dispatch(&event(EventKind::Create(CreateKind::File), &["/w/other/deep.txt"]));
        table.dispatch(&event(EventKind::Create(CreateKind::File), &["/elsewhere/x"]));
        table.dispatch(&event(EventKind::Other, &["/w/a"]));

        assert!(root.lock().is_empty());
        assert!(sub.lock().is_empty());
    }

    #[test]
    fn test_removed_route_receives_nothing() {
        let table = RouteTable::default();
        let (sink, seen) = recording_sink();
        let id = table.insert_keys(vec![PathBuf::from("/w")], sink);
        table.remove(id);

        table.dispatch(&event(EventKind::Create(CreateKind::File), &["/w/f"]));
        assert!(seen.lock().is_empty());
        assert!(table.inner.lock().by_path.is_empty());
    }

    #[test]
    fn test_canonical_spelling_accepted() {
        let table = RouteTable::default();
        let (sink, seen) = recording_sink();
        table.insert_keys(
            vec![PathBuf::from("/var/tmp/w"), PathBuf::from("/private/var/tmp/w")],
            sink,
        );

        table.dispatch(&event(EventKind::Create(CreateKind::File), &["/private/var/tmp/w/f"]));
        table.dispatch(&event(EventKind::Create(CreateKind::File), &["/var/tmp/w/g"]));
        assert_eq!(
            *seen.lock(),
            vec![named(EventType::Create, "f"), named(EventType::Create, "g")]
        );
    }

    #[test]
    fn test_unreported_bits() {
        if cfg!(target_os = "linux") {
            assert_eq!(
                NotifyPrimitive::UNREPORTED,
                EventMask::ACCESS | EventMask::CLOSE_NOWRITE
            );
        }
        assert!(!NotifyPrimitive::UNREPORTED.intersects(EventMask::CREATE | EventMask::DELETE_SELF));
    }
}
