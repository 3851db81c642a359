//! Observability event taxonomy.
//!
//! Events are enabled through a comma-separated property value. `all`
//! enables every code, an empty or absent value enables none, and any
//! unknown token disables all codes and reports the token on standard
//! error. The enabled set is collapsed into a 64-bit tag bit-set so the
//! hot paths can test a single word.

use std::collections::HashSet;
use std::io::Write;

/// Codes for events the driver can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventCode {
    FrameIn = 0,
    FrameOut = 1,
    CmdIn = 2,
    CmdOut = 3,
    RemovePublicationCleanup = 4,
    RemoveSubscriptionCleanup = 5,
    RemoveImageCleanup = 6,
    SendChannelCreation = 7,
    ReceiveChannelCreation = 8,
    ChannelError = 9,
}

impl EventCode {
    /// Every defined code, in tag-bit order.
    pub const ALL: [EventCode; 10] = [
        EventCode::FrameIn,
        EventCode::FrameOut,
        EventCode::CmdIn,
        EventCode::CmdOut,
        EventCode::RemovePublicationCleanup,
        EventCode::RemoveSubscriptionCleanup,
        EventCode::RemoveImageCleanup,
        EventCode::SendChannelCreation,
        EventCode::ReceiveChannelCreation,
        EventCode::ChannelError,
    ];

    /// The bit this code occupies in a tag bit-set.
    pub const fn tag_bit(self) -> u64 {
        1u64 << (self as u8)
    }

    /// The token naming this code in configuration.
    pub const fn name(self) -> &'static str {
        match self {
            EventCode::FrameIn => "FRAME_IN",
            EventCode::FrameOut => "FRAME_OUT",
            EventCode::CmdIn => "CMD_IN",
            EventCode::CmdOut => "CMD_OUT",
            EventCode::RemovePublicationCleanup => "REMOVE_PUBLICATION_CLEANUP",
            EventCode::RemoveSubscriptionCleanup => "REMOVE_SUBSCRIPTION_CLEANUP",
            EventCode::RemoveImageCleanup => "REMOVE_IMAGE_CLEANUP",
            EventCode::SendChannelCreation => "SEND_CHANNEL_CREATION",
            EventCode::ReceiveChannelCreation => "RECEIVE_CHANNEL_CREATION",
            EventCode::ChannelError => "CHANNEL_ERROR",
        }
    }

    /// Looks a code up by its configuration token.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.name() == name)
    }
}

/// Parses the enabled event codes from a property value.
///
/// `None` or an empty value enables nothing; `all` enables every code;
/// any unknown token yields the empty set and a diagnostic on stderr.
pub fn enabled_event_codes(spec: Option<&str>) -> HashSet<EventCode> {
    enabled_event_codes_to(spec, &mut std::io::stderr())
}

/// As [`enabled_event_codes`], writing diagnostics to `err`.
pub fn enabled_event_codes_to(spec: Option<&str>, err: &mut impl Write) -> HashSet<EventCode> {
    let mut codes = HashSet::new();

    let Some(spec) = spec else {
        return codes;
    };
    if spec.is_empty() || spec == "null" {
        return codes;
    }
    if spec == "all" {
        codes.extend(EventCode::ALL);
        return codes;
    }

    for token in spec.split(',') {
        match EventCode::from_name(token) {
            Some(code) => {
                codes.insert(code);
            }
            None => {
                let _ = writeln!(err, "Unknown event code: {token}");
                codes.clear();
                return codes;
            }
        }
    }

    codes
}

/// Collapses an enabled set into a tag bit-set.
pub fn make_tag_bit_set(codes: &HashSet<EventCode>) -> EventTags {
    EventTags(codes.iter().fold(0u64, |bits, c| bits | c.tag_bit()))
}

/// A 64-bit tag bit-set for fast event filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventTags(u64);

impl EventTags {
    /// No events enabled.
    pub const fn none() -> Self {
        Self(0)
    }

    /// All defined events enabled.
    pub fn all() -> Self {
        make_tag_bit_set(&EventCode::ALL.iter().copied().collect())
    }

    /// Whether `code` is enabled.
    pub const fn enabled(self, code: EventCode) -> bool {
        self.0 & code.tag_bit() != 0
    }

    /// The raw bit-set.
    pub const fn bits(self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_property_enables_nothing() {
        assert!(enabled_event_codes(None).is_empty());
        assert!(enabled_event_codes(Some("")).is_empty());
        assert!(enabled_event_codes(Some("null")).is_empty());
    }

    #[test]
    fn all_enables_every_code() {
        let codes = enabled_event_codes(Some("all"));
        assert_eq!(codes.len(), EventCode::ALL.len());
    }

    #[test]
    fn comma_list_is_parsed() {
        let codes = enabled_event_codes(Some("FRAME_OUT,FRAME_IN"));
        assert_eq!(codes.len(), 2);
        assert!(codes.contains(&EventCode::FrameOut));
        assert!(codes.contains(&EventCode::FrameIn));
    }

    #[test]
    fn unknown_token_disables_all_and_reports() {
        let mut err = Vec::new();
        let codes = enabled_event_codes_to(Some("bogus"), &mut err);
        assert!(codes.is_empty());
        let message = String::from_utf8(err).unwrap();
        assert!(message.starts_with("Unknown event code: bogus"));
    }

    #[test]
    fn unknown_token_in_list_disables_all() {
        let mut err = Vec::new();
        let codes = enabled_event_codes_to(Some("FRAME_IN,list of invalid options"), &mut err);
        assert!(codes.is_empty());
        let message = String::from_utf8(err).unwrap();
        assert!(message.starts_with("Unknown event code: list of invalid options"));
    }

    #[test]
    fn tag_bits_accumulate() {
        let codes = enabled_event_codes(Some("FRAME_OUT,FRAME_IN"));
        let tags = make_tag_bit_set(&codes);
        assert_eq!(
            tags.bits(),
            EventCode::FrameOut.tag_bit() | EventCode::FrameIn.tag_bit()
        );
        assert!(tags.enabled(EventCode::FrameIn));
        assert!(!tags.enabled(EventCode::CmdIn));
    }
}
