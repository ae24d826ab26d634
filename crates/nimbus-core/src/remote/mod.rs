//! Boundary to the remote drive API.
//!
//! The HTTP client itself lives outside this crate. Anything that can issue
//! authenticated GET, PUT and POST requests implements [`RemoteTransport`];
//! the lookups and folder creation the item cache needs are provided on top
//! of those primitives, decoding Graph JSON into [`DriveItemRecord`]s.

mod wire;

pub use wire::{DeletedFacet, DriveChildren, DriveItemRecord, FileFacet, FolderFacet, ParentRecord};

use crate::auth::Auth;
use crate::error::TransportResult;

/// Base URL of the Graph API; continuation links are made relative to it.
pub const GRAPH_URL: &str = "https://graph.microsoft.com/v1.0";

/// Prefix the service puts in front of every `parentReference.path`.
pub const ROOT_MARKER: &str = "/drive/root:";

/// Conflict behavior that makes folder creation fail on an existing name.
const CONFLICT_FAIL: &str = "fail";

/// Authenticated access to the remote drive.
///
/// Errors must keep the "name already exists" case distinguishable
/// ([`TransportError::AlreadyExists`](crate::TransportError::AlreadyExists));
/// identity resolution depends on it.
pub trait RemoteTransport: Send + Sync {
    /// GET a resource path, returning the response body.
    fn get(&self, path: &str, auth: &Auth) -> TransportResult<Vec<u8>>;

    /// PUT a body to a resource path, returning the response body.
    fn put(&self, path: &str, auth: &Auth, body: &[u8]) -> TransportResult<Vec<u8>>;

    /// POST a JSON body to a resource path, returning the response body.
    fn post(&self, path: &str, auth: &Auth, body: &[u8]) -> TransportResult<Vec<u8>>;

    /// Creates a folder named `name` under the folder with identifier
    /// `parent_id`. An existing item with that name is reported as
    /// [`TransportError::AlreadyExists`](crate::TransportError::AlreadyExists).
    fn create_folder(&self, parent_id: &str, name: &str, auth: &Auth) -> TransportResult<DriveItemRecord> {
        let request = DriveItemRecord {
            name: name.to_string(),
            folder: Some(FolderFacet::default()),
            conflict_behavior: Some(CONFLICT_FAIL.to_string()),
            ..DriveItemRecord::default()
        };
        let body = self.post(&item_children_path(parent_id), auth, &serde_json::to_vec(&request)?)?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Fetches the item at a filesystem path (e.g. `/Documents/a.txt`).
    fn item_by_path(&self, path: &str, auth: &Auth) -> TransportResult<DriveItemRecord> {
        let body = self.get(&resource_path(path), auth)?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Lists the children of the folder at a filesystem path, following
    /// continuation links until the listing is complete.
    fn children_of(&self, path: &str, auth: &Auth) -> TransportResult<Vec<DriveItemRecord>> {
        let mut next = Some(children_path(path));
        let mut children = Vec::new();
        while let Some(request) = next.take() {
            let body = self.get(&request, auth)?;
            let page: DriveChildren = serde_json::from_slice(&body)?;
            children.extend(page.value);
            next = page
                .next_link
                .map(|link| link.strip_prefix(GRAPH_URL).unwrap_or(&link).to_string());
        }
        Ok(children)
    }
}

/// Resource path of the item at a filesystem path.
pub fn resource_path(path: &str) -> String {
    if path == "/" {
        "/me/drive/root".to_string()
    } else {
        format!("/me/drive/root:{path}")
    }
}

/// Resource path listing the children of the folder at a filesystem path.
pub fn children_path(path: &str) -> String {
    if path == "/" {
        "/me/drive/root/children".to_string()
    } else {
        format!("/me/drive/root:{path}:/children")
    }
}

/// Resource path of the children collection of the folder with identifier `id`.
pub fn item_children_path(id: &str) -> String {
    format!("/me/drive/items/{id}/children")
}

/// Resource path of an item's content.
pub fn content_path(id: &str) -> String {
    format!("/me/drive/items/{id}/content")
}

/// Resource path for uploading content by name under a parent folder.
///
/// PUTting an empty body here is the placeholder upload that makes the
/// service assign an identifier.
pub fn placeholder_path(parent_id: &str, name: &str) -> String {
    format!("/me/drive/items/{parent_id}:/{name}:/content")
}

/// Joins a stored parent path and a name into a filesystem path.
///
/// Strips the service's root marker and collapses repeated separators.
pub fn join_path(parent_path: &str, name: &str) -> String {
    let joined = format!("{parent_path}/{name}");
    let stripped = joined.strip_prefix(ROOT_MARKER).unwrap_or(&joined);
    let mut out = String::with_capacity(stripped.len() + 1);
    for c in stripped.chars() {
        if c == '/' && out.ends_with('/') {
            continue;
        }
        out.push(c);
    }
    if !out.starts_with('/') {
        out.insert(0, '/');
    }
    out
}
