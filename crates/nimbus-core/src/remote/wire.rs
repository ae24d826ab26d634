//! JSON records exchanged with the drive API.
//!
//! Field names follow Microsoft Graph `driveItem` resources. Records are
//! decoded into fresh values and then copied onto live items field by field,
//! so a partial response can never clobber state an item already holds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::item::ItemKind;

/// Reference from an item to its parent folder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRecord {
    /// Parent's remote identifier.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Parent's path, prefixed with `/drive/root:`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
}

/// Folder facet. Present only on directories.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderFacet {
    /// Number of direct children reported by the server.
    #[serde(default)]
    pub child_count: u32,
}

/// File facet. Present only on regular files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFacet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Deleted facet, reported for items removed server-side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedFacet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// A `driveItem` as returned by listings, lookups and uploads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveItemRecord {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(
        rename = "lastModifiedDateTime",
        alias = "lastModifiedDatetime",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(
        rename = "parentReference",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub parent: Option<ParentRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<FolderFacet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileFacet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DeletedFacet>,
    #[serde(
        rename = "@microsoft.graph.conflictBehavior",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub conflict_behavior: Option<String>,
}

impl DriveItemRecord {
    /// Classifies the record.
    ///
    /// Anything without a file facet is a folder; this is also how the
    /// service represents the drive root.
    pub fn kind(&self) -> ItemKind {
        if self.deleted.is_some() {
            ItemKind::Deleted
        } else if self.file.is_some() {
            ItemKind::File
        } else {
            ItemKind::Directory
        }
    }

    /// Modification time, or the Unix epoch if the server omitted it.
    pub fn modified(&self) -> SystemTime {
        self.last_modified
            .map_or(SystemTime::UNIX_EPOCH, SystemTime::from)
    }
}

/// Body of a children listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriveChildren {
    #[serde(default)]
    pub value: Vec<DriveItemRecord>,
    /// Continuation link for paged listings.
    #[serde(
        rename = "@odata.nextLink",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub next_link: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE_JSON: &str = r#"{
        "id": "01BYE5RZ6QN3ZWBTUFOFD3GSPGOHDJD36K",
        "name": "report.txt",
        "size": 3,
        "lastModifiedDateTime": "2024-03-01T12:30:00Z",
        "parentReference": {"id": "01BYE5RZ56Y2GOVW7725BZO354PWSELRRZ", "path": "/drive/root:/Documents"},
        "file": {"mimeType": "text/plain"}
    }"#;

    #[test]
    fn test_decode_file_record() {
        let record: DriveItemRecord = serde_json::from_str(FILE_JSON).unwrap();
        assert_eq!(record.name, "report.txt");
        assert_eq!(record.size, 3);
        assert_eq!(record.kind(), ItemKind::File);
        let parent = record.parent.as_ref().unwrap();
        assert_eq!(parent.path, "/drive/root:/Documents");
        assert_eq!(
            record.file.as_ref().unwrap().mime_type.as_deref(),
            Some("text/plain")
        );
        let secs = record
            .modified()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert_eq!(secs, 1_709_296_200);
    }

    #[test]
    fn test_decode_accepts_lowercase_datetime_key() {
        let json = r#"{"id":"a","name":"x","lastModifiedDatetime":"1970-01-01T00:01:00Z"}"#;
        let record: DriveItemRecord = serde_json::from_str(json).unwrap();
        assert!(record.last_modified.is_some());
        assert_eq!(
            record.modified(),
            SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(60)
        );
    }

    #[test]
    fn test_kind_classification() {
        let folder: DriveItemRecord =
            serde_json::from_str(r#"{"id":"d","name":"Music","folder":{"childCount":4}}"#).unwrap();
        assert_eq!(folder.kind(), ItemKind::Directory);
        assert_eq!(folder.folder.unwrap().child_count, 4);

        let root: DriveItemRecord = serde_json::from_str(r#"{"id":"r","name":"root"}"#).unwrap();
        assert_eq!(root.kind(), ItemKind::Directory);

        let gone: DriveItemRecord = serde_json::from_str(
            r#"{"id":"g","name":"old.txt","file":{},"deleted":{"state":"deleted"}}"#,
        )
        .unwrap();
        assert_eq!(gone.kind(), ItemKind::Deleted);
    }

    #[test]
    fn test_missing_modified_time_is_epoch() {
        let record: DriveItemRecord = serde_json::from_str(r#"{"name":"x"}"#).unwrap();
        assert_eq!(record.modified(), SystemTime::UNIX_EPOCH);
        assert!(record.id.is_empty());
    }

    #[test]
    fn test_listing_body() {
        let json = r#"{"value":[{"id":"1","name":"a","file":{}},{"id":"2","name":"b","folder":{}}],
                       "@odata.nextLink":"https://graph.example/next"}"#;
        let listing: DriveChildren = serde_json::from_str(json).unwrap();
        assert_eq!(listing.value.len(), 2);
        assert_eq!(listing.next_link.as_deref(), Some("https://graph.example/next"));
    }

    #[test]
    fn test_serialize_skips_empty_fields() {
        let record = DriveItemRecord {
            name: "new.txt".to_string(),
            conflict_behavior: Some("fail".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("\"id\""));
        assert!(!json.contains("parentReference"));
        assert!(json.contains("@microsoft.graph.conflictBehavior"));
    }
}
