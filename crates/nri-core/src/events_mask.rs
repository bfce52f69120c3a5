//! Bitset over [`api::Event`] values.
//!
//! A plugin's `Configure` response carries one `u32` whose bits name the
//! events it wants delivered. `events == 0` means "all valid events".

use crate::api::Event;

/// All event kinds a plugin may legitimately subscribe to. `UNKNOWN_EVENT`
/// is excluded: it is never delivered and a plugin that claims it fails
/// registration.
pub const VALID_EVENTS: &[Event] = &[
    Event::RUN_POD_SANDBOX,
    Event::STOP_POD_SANDBOX,
    Event::REMOVE_POD_SANDBOX,
    Event::CREATE_CONTAINER,
    Event::POST_CREATE_CONTAINER,
    Event::START_CONTAINER,
    Event::POST_START_CONTAINER,
    Event::UPDATE_CONTAINER,
    Event::POST_UPDATE_CONTAINER,
    Event::STOP_CONTAINER,
    Event::REMOVE_CONTAINER,
    Event::UPDATE_POD_SANDBOX,
    Event::POST_UPDATE_POD_SANDBOX,
    Event::VALIDATE_CONTAINER_ADJUSTMENT,
];

/// Mask of every bit in [`VALID_EVENTS`].
pub fn valid_events() -> EventMask {
    let mut mask = EventMask::new();
    mask.set(VALID_EVENTS);
    mask
}

fn bit(event: Event) -> u32 {
    let n = event as u32;
    debug_assert!(n > 0, "UNKNOWN_EVENT has no bit");
    1u32 << (n - 1)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventMask(u32);

impl EventMask {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw_value(&self) -> u32 {
        self.0
    }

    pub fn set(&mut self, events: &[Event]) {
        for &e in events {
            self.0 |= bit(e);
        }
    }

    pub fn is_set(&self, event: Event) -> bool {
        self.0 & bit(event) != 0
    }

    /// True if every bit set in `raw` names a valid event. A zero mask is
    /// always valid (it is resolved to "all events" by the caller).
    pub fn is_valid(raw: u32) -> bool {
        raw & !valid_events().raw_value() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_not_set_for_any_event() {
        let mask = EventMask::new();
        for &e in VALID_EVENTS {
            assert!(!mask.is_set(e));
        }
    }

    #[test]
    fn set_and_check_round_trips() {
        let mut mask = EventMask::new();
        mask.set(&[Event::START_CONTAINER, Event::REMOVE_CONTAINER]);
        assert!(mask.is_set(Event::START_CONTAINER));
        assert!(mask.is_set(Event::REMOVE_CONTAINER));
        assert!(!mask.is_set(Event::STOP_CONTAINER));

        let raw = mask.raw_value();
        let restored = EventMask::from_raw(raw);
        assert_eq!(restored, mask);
    }

    #[test]
    fn rejects_bits_outside_valid_set() {
        let bogus = 1u32 << 30;
        assert!(!EventMask::is_valid(bogus));
        assert!(EventMask::is_valid(valid_events().raw_value()));
        assert!(EventMask::is_valid(0));
    }
}
