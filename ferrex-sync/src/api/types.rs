//! Wire shapes of the media server API and their mapping into the cache
//! model.

use chrono::{DateTime, Utc};
use ferrex_sync_model::{
    CachedMediaItem, EntityId, MediaKind, ModelError, UserData, UserLibrary,
};
use serde::{Deserialize, Serialize};

/// Response envelope used by every JSON endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            error: None,
            message: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserDataDto {
    pub is_favorite: bool,
    pub playback_position_ticks: i64,
    pub play_count: u32,
    pub played: bool,
    pub last_played_date: Option<DateTime<Utc>>,
    pub is_watchlist: bool,
}

impl From<UserDataDto> for UserData {
    fn from(dto: UserDataDto) -> Self {
        UserData {
            is_favorite: dto.is_favorite,
            playback_position_ticks: dto.playback_position_ticks.max(0),
            play_count: dto.play_count,
            played: dto.played,
            last_played_date: dto.last_played_date,
            is_watchlist: dto.is_watchlist,
            ..UserData::default()
        }
    }
}

impl From<&UserData> for UserDataDto {
    fn from(data: &UserData) -> Self {
        Self {
            is_favorite: data.is_favorite,
            playback_position_ticks: data.playback_position_ticks,
            play_count: data.play_count,
            played: data.played,
            last_played_date: data.last_played_date,
            is_watchlist: data.is_watchlist,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemDto {
    pub id: String,
    #[serde(default)]
    pub source_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub sort_name: Option<String>,
    #[serde(rename = "type", default)]
    pub item_type: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub series_id: Option<String>,
    #[serde(default)]
    pub series_name: Option<String>,
    #[serde(default)]
    pub index_number: Option<u32>,
    #[serde(default)]
    pub parent_index_number: Option<u32>,
    #[serde(default)]
    pub run_time_ticks: Option<i64>,
    #[serde(default)]
    pub date_created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user_data: Option<UserDataDto>,
}

fn media_kind(item_type: &str) -> MediaKind {
    match item_type.to_ascii_lowercase().as_str() {
        "movie" => MediaKind::Movie,
        "series" => MediaKind::Series,
        "season" => MediaKind::Season,
        "episode" => MediaKind::Episode,
        "folder" | "collectionfolder" | "boxset" => MediaKind::Folder,
        _ => MediaKind::Other,
    }
}

fn optional_id(raw: Option<String>) -> Option<EntityId> {
    // Blank references are treated as absent
    raw.and_then(|raw| EntityId::new(raw).ok())
}

impl TryFrom<ItemDto> for CachedMediaItem {
    type Error = ModelError;

    fn try_from(dto: ItemDto) -> Result<Self, Self::Error> {
        Ok(CachedMediaItem {
            id: EntityId::new(&dto.id)?,
            source_id: optional_id(dto.source_id),
            name: dto.name,
            sort_name: dto.sort_name,
            kind: media_kind(&dto.item_type),
            parent_id: optional_id(dto.parent_id),
            series_id: optional_id(dto.series_id),
            series_name: dto.series_name,
            index_number: dto.index_number,
            parent_index_number: dto.parent_index_number,
            runtime_ticks: dto.run_time_ticks.filter(|t| *t > 0),
            date_added: dto.date_created,
            user_data: dto.user_data.map(UserData::from).unwrap_or_default(),
        })
    }
}

impl From<&CachedMediaItem> for ItemDto {
    fn from(item: &CachedMediaItem) -> Self {
        Self {
            id: item.id.to_string(),
            source_id: item.source_id.as_ref().map(ToString::to_string),
            name: item.name.clone(),
            sort_name: item.sort_name.clone(),
            item_type: item.kind.to_string(),
            parent_id: item.parent_id.as_ref().map(ToString::to_string),
            series_id: item.series_id.as_ref().map(ToString::to_string),
            series_name: item.series_name.clone(),
            index_number: item.index_number,
            parent_index_number: item.parent_index_number,
            run_time_ticks: item.runtime_ticks,
            date_created: item.date_added,
            user_data: Some(UserDataDto::from(&item.user_data)),
        }
    }
}

/// Map a list of wire items, skipping any without a usable id.
pub fn map_items(items: Vec<ItemDto>) -> Vec<CachedMediaItem> {
    items
        .into_iter()
        .filter_map(|dto| {
            let raw_id = dto.id.clone();
            match CachedMediaItem::try_from(dto) {
                Ok(item) => Some(item),
                Err(e) => {
                    log::warn!("[ApiClient] Skipping item '{}': {}", raw_id, e);
                    None
                }
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemPageDto {
    #[serde(default)]
    pub items: Vec<ItemDto>,
    #[serde(default)]
    pub total_record_count: usize,
    #[serde(default)]
    pub start_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryDto {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub collection_type: Option<String>,
}

impl TryFrom<LibraryDto> for UserLibrary {
    type Error = ModelError;

    fn try_from(dto: LibraryDto) -> Result<Self, Self::Error> {
        Ok(UserLibrary {
            id: EntityId::new(&dto.id)?,
            name: dto.name,
            collection_type: dto.collection_type,
        })
    }
}

impl From<&UserLibrary> for LibraryDto {
    fn from(library: &UserLibrary) -> Self {
        Self {
            id: library.id.to_string(),
            name: library.name.clone(),
            collection_type: library.collection_type.clone(),
        }
    }
}

/// Body of the playback start/progress/stopped reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackReport {
    pub item_id: EntityId,
    pub position_ticks: i64,
    #[serde(default)]
    pub is_paused: bool,
}

impl PlaybackReport {
    pub fn new(item_id: EntityId, position_ticks: i64) -> Self {
        Self {
            item_id,
            position_ticks: position_ticks.max(0),
            is_paused: false,
        }
    }

    pub fn paused(mut self, is_paused: bool) -> Self {
        self.is_paused = is_paused;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_dto_maps_ids_kinds_and_user_data() {
        let json = r#"{
            "id": "6F9619FF-8B86-D011-B42D-00C04FC964FF",
            "sourceId": "",
            "name": "Pilot",
            "type": "Episode",
            "seriesId": "S-1",
            "indexNumber": 1,
            "parentIndexNumber": 1,
            "runTimeTicks": 0,
            "userData": { "isFavorite": true, "playbackPositionTicks": -5 }
        }"#;
        let dto: ItemDto = serde_json::from_str(json).unwrap();
        let item = CachedMediaItem::try_from(dto).unwrap();

        assert_eq!(item.id.as_str(), "6f9619ff8b86d011b42d00c04fc964ff");
        assert_eq!(item.source_id, None);
        assert_eq!(item.kind, MediaKind::Episode);
        assert_eq!(item.series_id, Some(EntityId::new("s1").unwrap()));
        assert_eq!(item.runtime_ticks, None);
        assert!(item.user_data.is_favorite);
        assert_eq!(item.user_data.playback_position_ticks, 0);
        assert!(!item.user_data.has_pending());
    }

    #[test]
    fn map_items_skips_unusable_rows() {
        let items = vec![
            ItemDto::from(&CachedMediaItem::new(
                EntityId::new("ok").unwrap(),
                "Ok",
                MediaKind::Movie,
            )),
            serde_json::from_str(r#"{"id": " ", "name": "Broken"}"#).unwrap(),
        ];
        let mapped = map_items(items);
        assert_eq!(mapped.len(), 1);
        assert_eq!(mapped[0].kind, MediaKind::Movie);
    }
}
