use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::ids::{EntityId, UserId};
use crate::user_data::UserData;

/// Kind of optimistic mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ActionType {
    Favorite,
    Played,
    Watchlist,
}

impl ActionType {
    pub const ALL: [ActionType; 3] =
        [ActionType::Favorite, ActionType::Played, ActionType::Watchlist];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Favorite => "favorite",
            ActionType::Played => "played",
            ActionType::Watchlist => "watchlist",
        }
    }

    /// Current value of the flag this action controls.
    pub fn flag(&self, data: &UserData) -> bool {
        match self {
            ActionType::Favorite => data.is_favorite,
            ActionType::Played => data.played,
            ActionType::Watchlist => data.is_watchlist,
        }
    }

    pub fn is_pending(&self, data: &UserData) -> bool {
        match self {
            ActionType::Favorite => data.pending_favorite,
            ActionType::Played => data.pending_played,
            ActionType::Watchlist => data.pending_watchlist,
        }
    }

    pub fn set_pending(&self, data: &mut UserData, pending: bool) {
        match self {
            ActionType::Favorite => data.pending_favorite = pending,
            ActionType::Played => data.pending_played = pending,
            ActionType::Watchlist => data.pending_watchlist = pending,
        }
    }

    /// Write `value` into the fields this action owns.
    ///
    /// Marking played stamps the play and resets the resume position;
    /// marking unplayed only resets the position so the near-end rule
    /// cannot re-derive `played`.
    pub fn apply(&self, data: &mut UserData, value: bool, now: DateTime<Utc>) {
        match self {
            ActionType::Favorite => data.is_favorite = value,
            ActionType::Watchlist => data.is_watchlist = value,
            ActionType::Played => {
                if value && !data.played {
                    data.play_count = data.play_count.saturating_add(1);
                    data.last_played_date = Some(now);
                }
                data.played = value;
                data.playback_position_ticks = 0;
            }
        }
    }

    /// Copy the fields this action owns from `base` into `data`.
    pub fn restore(&self, data: &mut UserData, base: &UserData) {
        match self {
            ActionType::Favorite => data.is_favorite = base.is_favorite,
            ActionType::Watchlist => data.is_watchlist = base.is_watchlist,
            ActionType::Played => {
                data.played = base.played;
                data.play_count = base.play_count;
                data.last_played_date = base.last_played_date;
                data.playback_position_ticks = base.playback_position_ticks;
            }
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique key of a pending action.
///
/// Scoped per user like the cached rows whose `pending_*` flags mirror it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PendingKey {
    pub user_id: UserId,
    pub entity_id: EntityId,
    pub action_type: ActionType,
}

impl PendingKey {
    pub fn new(user_id: UserId, entity_id: EntityId, action_type: ActionType) -> Self {
        Self {
            user_id,
            entity_id,
            action_type,
        }
    }
}

impl std::fmt::Display for PendingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.user_id, self.entity_id, self.action_type)
    }
}

/// A queued, not-yet-confirmed optimistic mutation.
///
/// `intent_id` identifies the latest intent for the key; a confirmation
/// carrying an older intent id has been superseded. `rollback` holds the
/// last confirmed state of the entity, which is what a failed mutation
/// restores.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct PendingAction {
    pub entity_id: EntityId,
    pub action_type: ActionType,
    pub new_value: bool,
    pub timestamp: DateTime<Utc>,
    pub user_id: UserId,
    pub intent_id: Uuid,
    pub rollback: UserData,
}

impl PendingAction {
    pub fn new(
        user_id: UserId,
        entity_id: EntityId,
        action_type: ActionType,
        new_value: bool,
        rollback: UserData,
    ) -> Self {
        Self {
            entity_id,
            action_type,
            new_value,
            timestamp: Utc::now(),
            user_id,
            intent_id: Uuid::now_v7(),
            rollback,
        }
    }

    pub fn key(&self) -> PendingKey {
        PendingKey::new(
            self.user_id.clone(),
            self.entity_id.clone(),
            self.action_type,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn played_apply_and_restore_round_trip_owned_fields() {
        let base = UserData {
            playback_position_ticks: 1234,
            play_count: 2,
            is_favorite: true,
            ..Default::default()
        };
        let mut data = base.clone();

        ActionType::Played.apply(&mut data, true, Utc::now());
        assert!(data.played);
        assert_eq!(data.play_count, 3);
        assert_eq!(data.playback_position_ticks, 0);
        assert!(data.last_played_date.is_some());

        ActionType::Played.restore(&mut data, &base);
        assert_eq!(data, base);
    }

    #[test]
    fn restoring_one_action_leaves_other_flags_alone() {
        let base = UserData::default();
        let mut data = UserData {
            is_favorite: true,
            is_watchlist: true,
            ..Default::default()
        };

        ActionType::Favorite.restore(&mut data, &base);
        assert!(!data.is_favorite);
        assert!(data.is_watchlist);
    }

    #[test]
    fn keys_of_different_users_never_collide() {
        let entity = EntityId::new("m1").unwrap();
        let a = PendingAction::new(
            UserId::new("u1").unwrap(),
            entity.clone(),
            ActionType::Favorite,
            true,
            UserData::default(),
        );
        let b = PendingAction::new(
            UserId::new("u2").unwrap(),
            entity,
            ActionType::Favorite,
            true,
            UserData::default(),
        );
        assert_ne!(a.key(), b.key());
        assert_eq!(a.key().to_string(), "u1/m1:favorite");
    }

    #[test]
    fn pending_flags_map_to_their_action() {
        let mut data = UserData::default();
        for action in ActionType::ALL {
            action.set_pending(&mut data, true);
            assert!(action.is_pending(&data));
        }
        assert!(data.has_pending());
    }
}
