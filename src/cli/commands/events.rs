//! Events command.

use crate::watcher::{EventMask, EventType, NotifyPrimitive};

/// Rows of `(name, code)` for every event kind plus `ALL`.
pub fn event_table() -> Vec<(&'static str, u32)> {
    EventType::KNOWN
        .iter()
        .map(|kind| (kind.name(), kind.code()))
        .chain(std::iter::once(("ALL", EventMask::ALL_EVENTS.bits())))
        .collect()
}

/// Remark for an event kind the OS backend never reports.
fn unreported_note(code: u32) -> Option<&'static str> {
    let mask = EventMask::from_bits(code)?;
    (mask != EventMask::ALL_EVENTS && NotifyPrimitive::UNREPORTED.contains(mask))
        .then_some("not reported on this platform")
}

/// Run events command - list event names and bit values.
pub fn run_events() {
    for (name, code) in event_table() {
        match unreported_note(code) {
            Some(note) => println!("{name:<14} {code:#06x}  ({note})"),
            None => println!("{name:<14} {code:#06x}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_table() {
        let table = event_table();
        assert_eq!(table.len(), 13);
        assert_eq!(table[0], ("ACCESS", 0x0001));
        assert_eq!(table[8], ("CREATE", 0x0100));
        assert_eq!(table.last(), Some(&("ALL", 0x0FFF)));
    }

    #[test]
    fn test_unreported_kinds_are_marked() {
        assert_eq!(unreported_note(EventType::Create.code()), None);
        assert_eq!(unreported_note(EventMask::ALL_EVENTS.bits()), None);

        if cfg!(target_os = "linux") {
            assert!(unreported_note(EventType::Access.code()).is_some());
            assert!(unreported_note(EventType::CloseNowrite.code()).is_some());
        }
    }
}
