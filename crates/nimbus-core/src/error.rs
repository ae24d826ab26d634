//! Error types for the item cache.
//!
//! [`TransportError`] covers everything that can go wrong talking to the
//! remote drive API; [`ItemError`] is what item and tree operations return.
//! Neither panics across the host boundary: the mount layer maps both onto
//! errno values.

use crate::item::ItemHandle;
use serde::Deserialize;
use thiserror::Error;

/// Graph error code reported when an upload collides with an existing name.
pub const NAME_ALREADY_EXISTS: &str = "nameAlreadyExists";

/// Graph error code for a missing item.
pub const ITEM_NOT_FOUND: &str = "itemNotFound";

/// Errors raised by a [`RemoteTransport`](crate::remote::RemoteTransport).
#[derive(Debug, Error)]
pub enum TransportError {
    /// The server already has an item with this name in the target folder.
    #[error("Item already exists: {message}")]
    AlreadyExists {
        /// Server-provided message.
        message: String,
    },

    /// No remote item exists at the requested path.
    #[error("Remote item not found: {path}")]
    NotFound {
        /// Resource path that was requested.
        path: String,
    },

    /// The access token was rejected.
    #[error("Unauthorized")]
    Unauthorized,

    /// Any other non-success HTTP response.
    #[error("Remote API returned {status} ({code}): {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Graph error code, empty if the body carried none.
        code: String,
        /// Graph error message or raw body.
        message: String,
    },

    /// Connection-level failure (DNS, TLS, reset, timeout).
    #[error("Network error: {0}")]
    Network(String),

    /// The response body could not be decoded.
    #[error("Could not decode remote response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl TransportError {
    /// Returns true for the "name already exists" case.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, TransportError::AlreadyExists { .. })
    }

    /// Returns true if the remote item does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TransportError::NotFound { .. })
    }
}

#[derive(Debug, Default, Deserialize)]
struct GraphErrorBody {
    #[serde(default)]
    error: GraphErrorDetail,
}

#[derive(Debug, Default, Deserialize)]
struct GraphErrorDetail {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Builds a [`TransportError`] from a failed HTTP response.
///
/// Transports call this with the status code, the requested path and the
/// raw body. Graph reports conflicts as 409 with code `nameAlreadyExists`;
/// the code is what distinguishes them, not the status.
pub fn classify_response(status: u16, path: &str, body: &[u8]) -> TransportError {
    let detail = serde_json::from_slice::<GraphErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_else(|_| GraphErrorDetail {
            code: String::new(),
            message: String::from_utf8_lossy(body).into_owned(),
        });

    if detail.code == NAME_ALREADY_EXISTS {
        return TransportError::AlreadyExists {
            message: detail.message,
        };
    }
    match status {
        401 => TransportError::Unauthorized,
        404 => TransportError::NotFound {
            path: path.to_string(),
        },
        _ if detail.code == ITEM_NOT_FOUND => TransportError::NotFound {
            path: path.to_string(),
        },
        _ => TransportError::Status {
            status,
            code: detail.code,
            message: detail.message,
        },
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors returned by item and tree operations.
#[derive(Debug, Error)]
pub enum ItemError {
    /// Remote API failure.
    #[error("Transport failed: {0}")]
    Transport(#[from] TransportError),

    /// The item does not exist locally or remotely.
    #[error("Item not found: {0}")]
    NotFound(String),

    /// The handle no longer refers to a live item (evicted from the tree).
    #[error("Stale item handle: {0}")]
    StaleHandle(ItemHandle),

    /// Offset or length outside what the buffer can represent.
    #[error("Offset {offset} with length {len} is out of bounds")]
    OutOfBounds {
        /// Requested offset.
        offset: u64,
        /// Requested length.
        len: u64,
    },

    /// The buffer would grow past what the item cache can hold or upload.
    #[error("File size {size} exceeds the limit of {max} bytes")]
    FileTooLarge {
        /// Size the operation asked for.
        size: u64,
        /// The limit in force.
        max: u64,
    },

    /// A rename that would put a directory inside itself.
    #[error("Cannot move {0} into its own subtree")]
    InvalidMove(String),

    /// A directory operation on a file.
    #[error("Not a directory: {0}")]
    NotADirectory(String),

    /// A file operation on a directory.
    #[error("Is a directory: {0}")]
    IsADirectory(String),

    /// The parent has no remote identifier yet, so a child cannot be addressed.
    #[error("Parent of {0} has no remote identifier")]
    UnresolvedParent(String),

    /// The server answered with something that contradicts our state.
    #[error("Inconsistent remote state: {0}")]
    Inconsistent(String),

    /// A server response failed to decode.
    #[error("Could not decode item: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Result type for item operations.
pub type ItemResult<T> = Result<T, ItemError>;
