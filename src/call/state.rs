//! # Call State Machine
//!
//! ## Call Lifecycle:
//! 1. **Connecting**: initial state; devices acquired, remote session opening
//! 2. **Active**: remote signalled open; audio flows both ways
//! 3. **Ended**: remote closed, local end, or setup failure. Terminal.
//!
//! There is no reconnection: nothing leaves `Ended`.

use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Connecting,
    Active,
    Ended,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Connecting => "connecting",
            CallStatus::Active => "active",
            CallStatus::Ended => "ended",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Ended)
    }

    /// Apply a lifecycle event.
    ///
    /// ## Transitions:
    /// - Connecting + RemoteOpened → Active
    /// - Connecting | Active + RemoteClosed | LocalEnd | SetupFailed → Ended
    /// - anything else is rejected
    pub fn on_event(self, event: CallEvent) -> Result<CallStatus, InvalidTransition> {
        match (self, event) {
            (CallStatus::Connecting, CallEvent::RemoteOpened) => Ok(CallStatus::Active),
            (CallStatus::Connecting, CallEvent::RemoteClosed)
            | (CallStatus::Connecting, CallEvent::LocalEnd)
            | (CallStatus::Connecting, CallEvent::SetupFailed)
            | (CallStatus::Active, CallEvent::RemoteClosed)
            | (CallStatus::Active, CallEvent::LocalEnd) => Ok(CallStatus::Ended),
            (from, event) => Err(InvalidTransition { from, event }),
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Things that move a call between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEvent {
    RemoteOpened,
    RemoteClosed,
    LocalEnd,
    SetupFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: CallStatus,
    pub event: CallEvent,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no transition from {} on {:?}", self.from, self.event)
    }
}

impl std::error::Error for InvalidTransition {}

/// Wall-clock span during which the call was active.
///
/// Starts counting on entering `Active` and freezes on entering `Ended`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallClock {
    active_since: Option<Instant>,
    ended_at: Option<Instant>,
}

impl CallClock {
    pub fn record(&mut self, status: CallStatus) {
        self.record_at(status, Instant::now());
    }

    fn record_at(&mut self, status: CallStatus, at: Instant) {
        match status {
            CallStatus::Active if self.active_since.is_none() => self.active_since = Some(at),
            CallStatus::Ended if self.ended_at.is_none() => self.ended_at = Some(at),
            _ => {}
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration_at(Instant::now())
    }

    fn duration_at(&self, now: Instant) -> Duration {
        match self.active_since {
            Some(started) => self.ended_at.unwrap_or(now).saturating_duration_since(started),
            None => Duration::ZERO,
        }
    }
}

/// `MM:SS`, as shown on the call screen.
pub fn format_call_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVENTS: [CallEvent; 4] = [
        CallEvent::RemoteOpened,
        CallEvent::RemoteClosed,
        CallEvent::LocalEnd,
        CallEvent::SetupFailed,
    ];

    #[test]
    fn test_active_only_via_remote_open() {
        for event in EVENTS {
            let next = CallStatus::Connecting.on_event(event);
            if event == CallEvent::RemoteOpened {
                assert_eq!(next, Ok(CallStatus::Active));
            } else {
                assert_eq!(next, Ok(CallStatus::Ended));
            }
        }
        assert!(CallStatus::Active.on_event(CallEvent::RemoteOpened).is_err());
        assert!(CallStatus::Active.on_event(CallEvent::SetupFailed).is_err());
    }

    #[test]
    fn test_ended_is_terminal() {
        for event in EVENTS {
            assert!(CallStatus::Ended.on_event(event).is_err());
        }
        assert!(CallStatus::Ended.is_terminal());
        assert!(!CallStatus::Active.is_terminal());
    }

    #[test]
    fn test_clock_counts_only_active_span() {
        let origin = Instant::now();
        let mut clock = CallClock::default();
        assert_eq!(clock.duration_at(origin + Duration::from_secs(5)), Duration::ZERO);

        clock.record_at(CallStatus::Active, origin + Duration::from_secs(2));
        assert_eq!(clock.duration_at(origin + Duration::from_secs(12)), Duration::from_secs(10));

        clock.record_at(CallStatus::Ended, origin + Duration::from_secs(65));
        assert_eq!(clock.duration_at(origin + Duration::from_secs(500)), Duration::from_secs(63));
    }

    #[test]
    fn test_format_call_duration() {
        assert_eq!(format_call_duration(Duration::from_secs(0)), "00:00");
        assert_eq!(format_call_duration(Duration::from_secs(63)), "01:03");
        assert_eq!(format_call_duration(Duration::from_millis(599_900)), "09:59");
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&CallStatus::Active).unwrap(), "\"active\"");
    }
}
