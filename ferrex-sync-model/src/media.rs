use chrono::{DateTime, Utc};

use crate::ids::EntityId;
use crate::user_data::UserData;

/// Kind of a cached library entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MediaKind {
    Movie,
    Series,
    Season,
    Episode,
    Folder,
    #[default]
    Other,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Movie => write!(f, "Movie"),
            MediaKind::Series => write!(f, "Series"),
            MediaKind::Season => write!(f, "Season"),
            MediaKind::Episode => write!(f, "Episode"),
            MediaKind::Folder => write!(f, "Folder"),
            MediaKind::Other => write!(f, "Other"),
        }
    }
}

/// A library item as held in the local cache, including the signed-in
/// user's [`UserData`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct CachedMediaItem {
    pub id: EntityId,
    /// Identity of the same item in the alternate (provider/source) id space.
    #[cfg_attr(feature = "serde", serde(default))]
    pub source_id: Option<EntityId>,
    pub name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub sort_name: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub kind: MediaKind,
    #[cfg_attr(feature = "serde", serde(default))]
    pub parent_id: Option<EntityId>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub series_id: Option<EntityId>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub series_name: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub index_number: Option<u32>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub parent_index_number: Option<u32>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub runtime_ticks: Option<i64>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub date_added: Option<DateTime<Utc>>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub user_data: UserData,
}

impl CachedMediaItem {
    pub fn new(id: EntityId, name: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id,
            source_id: None,
            name: name.into(),
            sort_name: None,
            kind,
            parent_id: None,
            series_id: None,
            series_name: None,
            index_number: None,
            parent_index_number: None,
            runtime_ticks: None,
            date_added: None,
            user_data: UserData::default(),
        }
    }

    /// Key used for name ordering; falls back to the display name.
    pub fn sort_key(&self) -> String {
        self.sort_name
            .as_deref()
            .unwrap_or(&self.name)
            .to_lowercase()
    }

    /// Copy of this item with read-time derivations applied.
    pub fn resolved(&self) -> CachedMediaItem {
        let mut out = self.clone();
        out.user_data = self.user_data.resolved(self.runtime_ticks);
        out
    }

    /// True if `id` names this item in either id space.
    pub fn is_identified_by(&self, id: &EntityId) -> bool {
        &self.id == id || self.source_id.as_ref() == Some(id)
    }
}

/// A user's top-level library view.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct UserLibrary {
    pub id: EntityId,
    pub name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub collection_type: Option<String>,
}
