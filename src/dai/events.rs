use parking_lot::Mutex;
use serde::Serialize;

/// Adbreak lifetime markers on the player's event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AdReservationEventKind {
    Start,
    End,
}

/// Individual-ad lifetime markers on the player's event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AdPlacementEventKind {
    Start,
    End,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdReservationEvent {
    pub kind: AdReservationEventKind,
    pub break_id: String,
    pub position_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdPlacementEvent {
    pub kind: AdPlacementEventKind,
    pub ad_id: String,
    /// Offset into the base period at emission time
    pub position_ms: u64,
    /// Wall-clock position of the ad, in milliseconds since the epoch
    pub absolute_ms: u64,
    /// Offset into the base period where the ad starts
    pub offset_ms: u64,
    pub duration_ms: u64,
    pub error_code: Option<i32>,
}

/// Sink for ad reservation and placement events.
///
/// The ad manager emits through this seam; the player wires it to its
/// event bus. Implementations must tolerate being called from the manager
/// right after a state transition, outside any manager lock.
pub trait AdEventSink: Send + Sync {
    fn send_reservation_event(&self, event: AdReservationEvent);
    fn send_placement_event(&self, event: AdPlacementEvent);
}

/// Sink that drops every event, for hosts without an event bus.
pub struct NullAdEventSink;

impl AdEventSink for NullAdEventSink {
    fn send_reservation_event(&self, _event: AdReservationEvent) {}
    fn send_placement_event(&self, _event: AdPlacementEvent) {}
}

/// Sink that collects events in memory, preserving emission order across
/// both kinds. Used by tests and diagnostics.
#[derive(Default)]
pub struct RecordingAdEventSink {
    events: Mutex<Vec<RecordedAdEvent>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedAdEvent {
    Reservation(AdReservationEvent),
    Placement(AdPlacementEvent),
}

impl RecordingAdEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<RecordedAdEvent> {
        std::mem::take(&mut self.events.lock())
    }

    pub fn events(&self) -> Vec<RecordedAdEvent> {
        self.events.lock().clone()
    }
}

impl AdEventSink for RecordingAdEventSink {
    fn send_reservation_event(&self, event: AdReservationEvent) {
        self.events.lock().push(RecordedAdEvent::Reservation(event));
    }

    fn send_placement_event(&self, event: AdPlacementEvent) {
        self.events.lock().push(RecordedAdEvent::Placement(event));
    }
}
