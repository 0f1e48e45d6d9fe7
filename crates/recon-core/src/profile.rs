//! Per-identity profile records and the open tag catalogs they reference.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Display color for tags missing from the catalog.
pub const FALLBACK_TAG_COLOR: &str = "#808080";

fn unknown() -> String {
    "Unknown".to_string()
}

/// Persisted profile of one registered person (`profile.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Stable identifier; nil in legacy records until one is assigned.
    #[serde(default = "Uuid::nil")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default = "unknown")]
    pub gender: String,
    #[serde(default = "unknown")]
    pub occupation: String,
    #[serde(default = "unknown")]
    pub nationality: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub threat_level: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub sightings: u64,
    #[serde(default, with = "timestamp")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            age: None,
            gender: unknown(),
            occupation: unknown(),
            nationality: unknown(),
            status: String::new(),
            threat_level: String::new(),
            notes: String::new(),
            sightings: 0,
            last_seen: None,
        }
    }

    /// Count one sighting at `at`. The last-seen timestamp never moves backwards.
    pub fn record_sighting(&mut self, at: DateTime<Utc>) {
        self.sightings = self.sightings.saturating_add(1);
        self.last_seen = Some(match self.last_seen {
            Some(prev) if prev > at => prev,
            _ => at,
        });
    }
}

/// One entry of a user-extensible enumeration (status types, threat levels).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub color: String,
}

impl Tag {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self { name: name.into(), color: color.into() }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TagError {
    #[error("{kind} tag name must not be empty")]
    EmptyName { kind: &'static str },
}

/// Currently valid status/threat/gender values, owned by the settings layer.
///
/// An empty list disables validation for that field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagCatalog {
    statuses: Vec<Tag>,
    threat_levels: Vec<Tag>,
    genders: Vec<String>,
}

impl TagCatalog {
    /// Build a catalog, rejecting blank names and dropping duplicates.
    pub fn new(
        statuses: Vec<Tag>,
        threat_levels: Vec<Tag>,
        genders: Vec<String>,
    ) -> Result<Self, TagError> {
        Ok(Self {
            statuses: dedup_tags(statuses, "status")?,
            threat_levels: dedup_tags(threat_levels, "threat level")?,
            genders: dedup_names(genders)?,
        })
    }

    pub fn statuses(&self) -> &[Tag] {
        &self.statuses
    }

    pub fn threat_levels(&self) -> &[Tag] {
        &self.threat_levels
    }

    pub fn genders(&self) -> &[String] {
        &self.genders
    }

    pub fn status_color(&self, name: &str) -> &str {
        color_of(&self.statuses, name)
    }

    pub fn threat_color(&self, name: &str) -> &str {
        color_of(&self.threat_levels, name)
    }

    /// Profile fields whose value is not in the current catalog, as
    /// `(field, value)` pairs. Empty values are not reported.
    pub fn stale_tags<'p>(&self, profile: &'p Profile) -> Vec<(&'static str, &'p str)> {
        let mut stale = Vec::new();
        if !self.statuses.is_empty()
            && !profile.status.is_empty()
            && !self.statuses.iter().any(|t| t.name == profile.status)
        {
            stale.push(("status", profile.status.as_str()));
        }
        if !self.threat_levels.is_empty()
            && !profile.threat_level.is_empty()
            && !self.threat_levels.iter().any(|t| t.name == profile.threat_level)
        {
            stale.push(("threat_level", profile.threat_level.as_str()));
        }
        if !self.genders.is_empty()
            && !profile.gender.is_empty()
            && profile.gender != unknown()
            && !self.genders.iter().any(|g| *g == profile.gender)
        {
            stale.push(("gender", profile.gender.as_str()));
        }
        stale
    }
}

fn color_of<'a>(tags: &'a [Tag], name: &str) -> &'a str {
    tags.iter()
        .find(|t| t.name == name)
        .map(|t| t.color.as_str())
        .unwrap_or(FALLBACK_TAG_COLOR)
}

fn dedup_tags(tags: Vec<Tag>, kind: &'static str) -> Result<Vec<Tag>, TagError> {
    let mut out: Vec<Tag> = Vec::with_capacity(tags.len());
    for mut tag in tags {
        tag.name = tag.name.trim().to_string();
        if tag.name.is_empty() {
            return Err(TagError::EmptyName { kind });
        }
        if !out.iter().any(|t| t.name == tag.name) {
            out.push(tag);
        }
    }
    Ok(out)
}

fn dedup_names(names: Vec<String>) -> Result<Vec<String>, TagError> {
    let mut out: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(TagError::EmptyName { kind: "gender" });
        }
        if !out.contains(&name) {
            out.push(name);
        }
    }
    Ok(out)
}

/// `last_seen` is written as RFC 3339 and read from either RFC 3339 or the
/// legacy local-time `YYYY-MM-DD HH:MM:SS` form.
mod timestamp {
    use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const LEGACY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => serializer.serialize_str(&ts.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let Some(raw) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("never") {
            return Ok(None);
        }
        parse(raw).map(Some).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse(raw: &str) -> Result<DateTime<Utc>, String> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Ok(ts.with_timezone(&Utc));
        }
        let naive = NaiveDateTime::parse_from_str(raw, LEGACY_FORMAT)
            .map_err(|e| format!("unrecognized timestamp {raw:?}: {e}"))?;
        Ok(match Local.from_local_datetime(&naive).earliest() {
            Some(local) => local.with_timezone(&Utc),
            None => naive.and_utc(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_legacy_record_parses() {
        let json = r#"{
            "name": "Alice",
            "age": 31,
            "gender": "Female",
            "occupation": "Engineer",
            "nationality": "Unknown",
            "status": "VIP",
            "threat_level": "LOW",
            "last_seen": "2024-03-01 12:30:00",
            "notes": "No additional information.",
            "sightings": 4
        }"#;
        let profile: Profile = serde_json::from_str(json).unwrap();
        assert!(profile.id.is_nil());
        assert_eq!(profile.age, Some(31));
        assert_eq!(profile.sightings, 4);
        assert!(profile.last_seen.is_some());
    }

    #[test]
    fn test_minimal_record_defaults() {
        let profile: Profile = serde_json::from_str(r#"{"name": "Bob"}"#).unwrap();
        assert_eq!(profile.age, None);
        assert_eq!(profile.gender, "Unknown");
        assert_eq!(profile.sightings, 0);
        assert_eq!(profile.last_seen, None);
    }

    #[test]
    fn test_last_seen_rfc3339_roundtrip() {
        let mut profile = Profile::new("Carol");
        profile.last_seen = Some(Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap());
        let json = serde_json::to_string(&profile).unwrap();
        assert!(json.contains("2025-01-02T03:04:05+00:00"));
        let back: Profile = serde_json::from_str(&json).unwrap();
        assert_eq!(back, profile);
    }

    #[test]
    fn test_bad_timestamp_rejected() {
        let err = serde_json::from_str::<Profile>(r#"{"name": "Dan", "last_seen": "yesterday"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_record_sighting_monotonic() {
        let t1 = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 11, 0, 0).unwrap();
        let mut profile = Profile::new("Eve");
        profile.record_sighting(t1);
        profile.record_sighting(t0);
        assert_eq!(profile.sightings, 2);
        assert_eq!(profile.last_seen, Some(t1));
    }

    #[test]
    fn test_catalog_colors_and_fallback() {
        let catalog = TagCatalog::new(
            vec![Tag::new("VIP", "#FFD700")],
            vec![Tag::new("HIGH", "#FF4444")],
            vec![],
        )
        .unwrap();
        assert_eq!(catalog.status_color("VIP"), "#FFD700");
        assert_eq!(catalog.threat_color("HIGH"), "#FF4444");
        assert_eq!(catalog.status_color("RETIRED"), FALLBACK_TAG_COLOR);
    }

    #[test]
    fn test_catalog_rejects_blank_and_dedups() {
        let err = TagCatalog::new(vec![Tag::new("  ", "#000")], vec![], vec![]).unwrap_err();
        assert_eq!(err, TagError::EmptyName { kind: "status" });

        let catalog = TagCatalog::new(
            vec![Tag::new("VIP", "#1"), Tag::new("VIP", "#2")],
            vec![],
            vec!["Male".into(), "Male".into()],
        )
        .unwrap();
        assert_eq!(catalog.statuses().len(), 1);
        assert_eq!(catalog.statuses()[0].color, "#1");
        assert_eq!(catalog.genders().len(), 1);
    }

    #[test]
    fn test_stale_tags() {
        let catalog = TagCatalog::new(
            vec![Tag::new("VIP", "#FFD700")],
            vec![Tag::new("LOW", "#00C864")],
            vec!["Female".into()],
        )
        .unwrap();
        let mut profile = Profile::new("Frank");
        profile.status = "FORMER_VIP".into();
        profile.threat_level = "LOW".into();
        profile.gender = "Male".into();
        let stale = catalog.stale_tags(&profile);
        assert_eq!(stale, vec![("status", "FORMER_VIP"), ("gender", "Male")]);

        assert!(TagCatalog::default().stale_tags(&profile).is_empty());
    }
}
