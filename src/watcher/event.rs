//! Event codes, masks and the delivered event shape.
//!
//! Bit values follow the inotify numbering so masks built on either side of
//! the bridge agree without translation.

use std::path::PathBuf;

use bitflags::bitflags;
use serde::Serialize;

bitflags! {
    /// Selects which kinds of change a watch delivers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventMask: u32 {
        const ACCESS = 0x0001;
        const MODIFY = 0x0002;
        const ATTRIB = 0x0004;
        const CLOSE_WRITE = 0x0008;
        const CLOSE_NOWRITE = 0x0010;
        const OPEN = 0x0020;
        const MOVED_FROM = 0x0040;
        const MOVED_TO = 0x0080;
        const CREATE = 0x0100;
        const DELETE = 0x0200;
        const DELETE_SELF = 0x0400;
        const MOVE_SELF = 0x0800;
    }
}

impl EventMask {
    /// Convenience mask covering every event kind.
    pub const ALL_EVENTS: EventMask = EventMask::all();

    /// Parse a comma separated list of event names, e.g. `"CREATE,MODIFY"`.
    ///
    /// Names are case-insensitive and `ALL` selects everything.
    pub fn parse_list(list: &str) -> Result<Self, String> {
        Self::from_names(list.split(','))
    }

    /// Build a mask from individual event names.
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<Self, String> {
        let mut mask = EventMask::empty();
        for name in names {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let upper = name.to_ascii_uppercase();
            if upper == "ALL" {
                mask |= EventMask::ALL_EVENTS;
                continue;
            }
            match EventMask::from_name(&upper) {
                Some(flag) => mask |= flag,
                None => return Err(format!("unknown event name '{name}'")),
            }
        }
        Ok(mask)
    }

    /// Mask from an integer received over the bridge. Unknown bits are dropped.
    pub fn from_code(code: u32) -> Self {
        EventMask::from_bits_truncate(code)
    }
}

impl Default for EventMask {
    fn default() -> Self {
        EventMask::ALL_EVENTS
    }
}

/// A single event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EventType {
    Access = 0x0001,
    Modify = 0x0002,
    Attrib = 0x0004,
    CloseWrite = 0x0008,
    CloseNowrite = 0x0010,
    Open = 0x0020,
    MovedFrom = 0x0040,
    MovedTo = 0x0080,
    Create = 0x0100,
    Delete = 0x0200,
    DeleteSelf = 0x0400,
    MoveSelf = 0x0800,
    Unknown = 0,
}

impl EventType {
    pub const KNOWN: [EventType; 12] = [
        EventType::Access,
        EventType::Modify,
        EventType::Attrib,
        EventType::CloseWrite,
        EventType::CloseNowrite,
        EventType::Open,
        EventType::MovedFrom,
        EventType::MovedTo,
        EventType::Create,
        EventType::Delete,
        EventType::DeleteSelf,
        EventType::MoveSelf,
    ];

    /// Resolve a code to its event kind. Anything that is not exactly one
    /// known bit is `Unknown`.
    pub fn from_code(code: u32) -> Self {
        Self::KNOWN
            .into_iter()
            .find(|kind| kind.code() == code)
            .unwrap_or(EventType::Unknown)
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            EventType::Access => "ACCESS",
            EventType::Modify => "MODIFY",
            EventType::Attrib => "ATTRIB",
            EventType::CloseWrite => "CLOSE_WRITE",
            EventType::CloseNowrite => "CLOSE_NOWRITE",
            EventType::Open => "OPEN",
            EventType::MovedFrom => "MOVED_FROM",
            EventType::MovedTo => "MOVED_TO",
            EventType::Create => "CREATE",
            EventType::Delete => "DELETE",
            EventType::DeleteSelf => "DELETE_SELF",
            EventType::MoveSelf => "MOVE_SELF",
            EventType::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Event as delivered to a subscriber.
///
/// `path` is the root the subscriber asked to watch, not the child that
/// changed. The originating path is kept in `source` for diagnostics and is
/// not part of the serialized shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchEvent {
    pub event_type: u32,
    pub path: PathBuf,
    pub event_name: &'static str,
    #[serde(skip)]
    pub source: PathBuf,
}

impl WatchEvent {
    /// Build an event from an already-masked code.
    pub fn new(code: u32, root: PathBuf, source: PathBuf) -> Self {
        Self {
            event_type: code,
            path: root,
            event_name: EventType::from_code(code).name(),
            source,
        }
    }

    pub fn kind(&self) -> EventType {
        EventType::from_code(self.event_type)
    }
}
