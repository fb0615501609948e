use crate::error::{ModelError, Result};

fn normalize(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| !matches!(c, '-' | '{' | '}'))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Opaque identity of a library entity.
///
/// Servers hand out the same id in several spellings (hyphenated GUIDs,
/// bare hex, upper case). Construction normalizes so that every spelling
/// of one logical id compares and hashes equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub struct EntityId(String);

impl EntityId {
    pub fn new(raw: impl AsRef<str>) -> Result<Self> {
        let normalized = normalize(raw.as_ref());
        if normalized.is_empty() {
            return Err(ModelError::InvalidId(format!(
                "entity id '{}' is empty after normalization",
                raw.as_ref()
            )));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when `raw` names this entity in any accepted spelling.
    pub fn matches(&self, raw: &str) -> bool {
        normalize(raw) == self.0
    }
}

impl TryFrom<String> for EntityId {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for EntityId {
    type Error = ModelError;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl From<EntityId> for String {
    fn from(value: EntityId) -> Self {
        value.0
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of the signed-in user owning cached rows.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub struct UserId(String);

impl UserId {
    pub fn new(raw: impl AsRef<str>) -> Result<Self> {
        let normalized = normalize(raw.as_ref());
        if normalized.is_empty() {
            return Err(ModelError::InvalidId(format!(
                "user id '{}' is empty after normalization",
                raw.as_ref()
            )));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserId {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for UserId {
    type Error = ModelError;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl From<UserId> for String {
    fn from(value: UserId) -> Self {
        value.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hyphenated_and_bare_guids_are_the_same_entity() {
        let a = EntityId::new("6F9619FF-8B86-D011-B42D-00C04FC964FF").unwrap();
        let b = EntityId::new("6f9619ff8b86d011b42d00c04fc964ff").unwrap();
        let c = EntityId::new("{6f9619ff-8b86-d011-b42d-00c04fc964ff}").unwrap();

        assert_eq!(a, b);
        assert_eq!(b, c);
        assert!(a.matches(" 6F9619FF8B86D011B42D00C04FC964FF "));
    }

    #[test]
    fn blank_ids_are_rejected() {
        assert!(EntityId::new("  ").is_err());
        assert!(EntityId::new("--").is_err());
        assert!(UserId::new("").is_err());
    }

    #[test]
    fn short_ids_keep_their_text() {
        let id = EntityId::new("m-42").unwrap();
        assert_eq!(id.as_str(), "m42");
        assert!(id.matches("M-42"));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn deserializing_normalizes() {
        let id: EntityId = serde_json::from_str("\"AB-CD\"").unwrap();
        assert_eq!(id.as_str(), "abcd");
        assert!(serde_json::from_str::<EntityId>("\"\"").is_err());
    }
}
