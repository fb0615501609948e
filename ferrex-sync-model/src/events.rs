//! Realtime events pushed by the server over the session event stream.

use crate::ids::EntityId;

/// Typed event delivered by the realtime stream.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")
)]
pub enum RealtimeEvent {
    /// Playback position heartbeat for an item.
    Progress {
        entity_id: EntityId,
        position_ticks: i64,
    },
    /// Playback of an item stopped at `position_ticks`.
    Stop {
        entity_id: EntityId,
        position_ticks: i64,
    },
    /// User data (favorite, played, ...) changed server-side.
    UserDataChanged { entity_ids: Vec<EntityId> },
    /// Library contents changed.
    LibraryChanged {
        #[cfg_attr(feature = "serde", serde(default))]
        added: Vec<EntityId>,
        #[cfg_attr(feature = "serde", serde(default))]
        updated: Vec<EntityId>,
        #[cfg_attr(feature = "serde", serde(default))]
        removed: Vec<EntityId>,
    },
}

impl RealtimeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RealtimeEvent::Progress { .. } => "progress",
            RealtimeEvent::Stop { .. } => "stop",
            RealtimeEvent::UserDataChanged { .. } => "user_data_changed",
            RealtimeEvent::LibraryChanged { .. } => "library_changed",
        }
    }

    /// Whether this event concerns `id`.
    pub fn touches(&self, id: &EntityId) -> bool {
        match self {
            RealtimeEvent::Progress { entity_id, .. }
            | RealtimeEvent::Stop { entity_id, .. } => entity_id == id,
            RealtimeEvent::UserDataChanged { entity_ids } => entity_ids.contains(id),
            RealtimeEvent::LibraryChanged {
                added,
                updated,
                removed,
            } => added.contains(id) || updated.contains(id) || removed.contains(id),
        }
    }
}

/// One framed message of the event stream.
///
/// `id` is the server-assigned event id used for de-duplication across
/// reconnects; frames without one are delivered as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub id: Option<String>,
    pub event: RealtimeEvent,
}

impl StreamFrame {
    pub fn new(id: Option<String>, event: RealtimeEvent) -> Self {
        Self { id, event }
    }
}

#[cfg(all(test, feature = "serde"))]
mod tests {
    use super::*;

    #[test]
    fn progress_frame_parses_from_wire_json() {
        let json = r#"{"type":"progress","entityId":"AB-12","positionTicks":42}"#;
        let event: RealtimeEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            RealtimeEvent::Progress {
                entity_id: EntityId::new("ab12").unwrap(),
                position_ticks: 42,
            }
        );
    }

    #[test]
    fn library_changed_lists_default_to_empty() {
        let json = r#"{"type":"libraryChanged","removed":["x1"]}"#;
        let event: RealtimeEvent = serde_json::from_str(json).unwrap();
        assert!(event.touches(&EntityId::new("X1").unwrap()));
        assert_eq!(event.kind(), "library_changed");
    }
}
