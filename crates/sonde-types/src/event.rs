//! Events carried by the bus, and the topic naming scheme.

use serde::{Deserialize, Serialize};

use crate::feature::FeatureDesc;
use crate::swe::{DataBlock, DataComponent};
use crate::time::Timestamp;

/// Hierarchical topic identifiers.
///
/// `urn:osh:registry` carries global system lifecycle events,
/// `urn:osh:system:<uid>` a system's status events, and
/// `urn:osh:system:<uid>/<output>` one data stream's events.
pub mod topics {
    /// Global system lifecycle topic.
    pub const REGISTRY: &str = "urn:osh:registry";

    pub fn system_status(system_uid: &str) -> String {
        format!("urn:osh:system:{system_uid}")
    }

    pub fn data_stream(system_uid: &str, output_name: &str) -> String {
        format!("urn:osh:system:{system_uid}/{output_name}")
    }
}

/// New records produced on one output of a system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEvent {
    /// Producer-side event time; the fallback phenomenon time when the
    /// record schema carries no time leaf.
    pub timestamp: Timestamp,
    pub system_uid: String,
    pub output_name: String,
    /// Record structure of the payload. Producers attach it so the bridge
    /// can materialise a data stream on first sighting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<DataComponent>,
    /// UID of the feature of interest these records are about, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foi_uid: Option<String>,
    pub records: Vec<DataBlock>,
}

/// A feature of interest came into sight of a system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoiEvent {
    pub timestamp: Timestamp,
    pub system_uid: String,
    pub foi: FeatureDesc,
}

/// Every event type routed through the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HubEvent {
    SystemAdded {
        system_uid: String,
        name: String,
    },
    /// The system's description changed; a new version may have been stored.
    SystemChanged {
        system_uid: String,
    },
    SystemRemoved {
        system_uid: String,
    },
    DataStreamAdded {
        system_uid: String,
        output_name: String,
    },
    DataStreamChanged {
        system_uid: String,
        output_name: String,
    },
    DataStreamRemoved {
        system_uid: String,
        output_name: String,
    },
    Data(DataEvent),
    Foi(FoiEvent),
}

impl HubEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            HubEvent::SystemAdded { .. } => EventKind::SystemAdded,
            HubEvent::SystemChanged { .. } => EventKind::SystemChanged,
            HubEvent::SystemRemoved { .. } => EventKind::SystemRemoved,
            HubEvent::DataStreamAdded { .. } => EventKind::DataStreamAdded,
            HubEvent::DataStreamChanged { .. } => EventKind::DataStreamChanged,
            HubEvent::DataStreamRemoved { .. } => EventKind::DataStreamRemoved,
            HubEvent::Data(_) => EventKind::Data,
            HubEvent::Foi(_) => EventKind::Foi,
        }
    }
}

/// Discriminant of a [`HubEvent`] variant, for subscription type sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum EventKind {
    SystemAdded = 1 << 0,
    SystemChanged = 1 << 1,
    SystemRemoved = 1 << 2,
    DataStreamAdded = 1 << 3,
    DataStreamChanged = 1 << 4,
    DataStreamRemoved = 1 << 5,
    Data = 1 << 6,
    Foi = 1 << 7,
}

/// A set of event kinds, as a bit mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventKindSet(u16);

impl EventKindSet {
    /// The set matching every event kind.
    pub const ALL: EventKindSet = EventKindSet(u16::MAX);
    pub const EMPTY: EventKindSet = EventKindSet(0);

    pub fn of(kinds: &[EventKind]) -> Self {
        EventKindSet(kinds.iter().fold(0, |m, k| m | *k as u16))
    }

    pub fn contains(&self, kind: EventKind) -> bool {
        self.0 & kind as u16 != 0
    }

    pub fn insert(&mut self, kind: EventKind) {
        self.0 |= kind as u16;
    }
}

impl Default for EventKindSet {
    fn default() -> Self {
        Self::ALL
    }
}

impl FromIterator<EventKind> for EventKindSet {
    fn from_iter<T: IntoIterator<Item = EventKind>>(iter: T) -> Self {
        let mut set = EventKindSet::EMPTY;
        for k in iter {
            set.insert(k);
        }
        set
    }
}
