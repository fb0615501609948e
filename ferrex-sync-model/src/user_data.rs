//! Per-user playback state for a single library entity.
//!
//! Positions are expressed in ticks (100 ns). The stored `played` flag is
//! the raw server/local value; the "close enough to the end counts as
//! watched" rule is applied by [`UserData::resolved`] only, so callers that
//! persist `UserData` always persist raw values.

use chrono::{DateTime, Utc};

/// Number of ticks in one second.
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Distance from the end of an item within which playback counts as watched.
pub const PLAYED_THRESHOLD_TICKS: i64 = 10_000_000;

/// Convert a tick count to whole seconds.
pub fn ticks_to_seconds(ticks: i64) -> f64 {
    ticks as f64 / TICKS_PER_SECOND as f64
}

/// User-specific state for one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct UserData {
    pub is_favorite: bool,
    pub playback_position_ticks: i64,
    pub play_count: u32,
    pub played: bool,
    pub last_played_date: Option<DateTime<Utc>>,
    pub is_watchlist: bool,
    pub pending_favorite: bool,
    pub pending_played: bool,
    pub pending_watchlist: bool,
}

impl UserData {
    /// Whether `position_ticks` is close enough to `runtime_ticks` to count
    /// as a completed watch.
    pub fn is_near_end(position_ticks: i64, runtime_ticks: Option<i64>) -> bool {
        match runtime_ticks {
            Some(runtime) if runtime > 0 && position_ticks > 0 => {
                position_ticks >= runtime.saturating_sub(PLAYED_THRESHOLD_TICKS)
            }
            _ => false,
        }
    }

    /// Read-time view of this state with `played` derived from the raw
    /// position. Never persist the returned value.
    pub fn resolved(&self, runtime_ticks: Option<i64>) -> UserData {
        let mut out = self.clone();
        out.played = self.played
            || Self::is_near_end(self.playback_position_ticks, runtime_ticks);
        out
    }

    /// True if any optimistic mutation is outstanding for this entity.
    pub fn has_pending(&self) -> bool {
        self.pending_favorite || self.pending_played || self.pending_watchlist
    }

    /// Fraction watched in `0.0..=1.0`, if the runtime is known.
    pub fn progress(&self, runtime_ticks: Option<i64>) -> Option<f32> {
        let runtime = runtime_ticks.filter(|r| *r > 0)?;
        let ratio = self.playback_position_ticks as f64 / runtime as f64;
        Some(ratio.clamp(0.0, 1.0) as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUNTIME: i64 = 60 * 60 * TICKS_PER_SECOND;

    #[test]
    fn near_end_counts_as_played_only_when_resolved() {
        let raw = UserData {
            playback_position_ticks: RUNTIME - PLAYED_THRESHOLD_TICKS / 2,
            ..Default::default()
        };

        assert!(!raw.played);
        assert!(raw.resolved(Some(RUNTIME)).played);
        // resolving twice gives the same answer
        assert_eq!(
            raw.resolved(Some(RUNTIME)).resolved(Some(RUNTIME)),
            raw.resolved(Some(RUNTIME))
        );
    }

    #[test]
    fn mid_item_position_is_not_played() {
        let raw = UserData {
            playback_position_ticks: RUNTIME / 2,
            ..Default::default()
        };
        assert!(!raw.resolved(Some(RUNTIME)).played);
        assert_eq!(raw.progress(Some(RUNTIME)), Some(0.5));
    }

    #[test]
    fn unknown_runtime_never_derives_played() {
        let raw = UserData {
            playback_position_ticks: i64::MAX,
            ..Default::default()
        };
        assert!(!raw.resolved(None).played);
        assert!(!raw.resolved(Some(0)).played);
        assert_eq!(raw.progress(None), None);
    }

    #[test]
    fn zero_position_is_not_played_even_for_tiny_runtime() {
        let raw = UserData::default();
        assert!(!raw.resolved(Some(PLAYED_THRESHOLD_TICKS / 2)).played);
    }
}
