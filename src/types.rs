//! Core types for usenet-writer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Unique identifier for a download (one NZB)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownloadId(pub i64);

impl DownloadId {
    /// Create a new DownloadId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for DownloadId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for DownloadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a file within the download queue
///
/// Used to name per-segment temp files and the direct-write artifact, so it
/// must be unique across all downloads of the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub u32);

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Encoding of a downloaded article as reported by the decoder
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArticleFormat {
    /// Not (yet) detected
    #[default]
    Unknown,
    /// yEnc encoded; carries part offsets, so direct-write is possible
    Yenc,
    /// UU encoded
    Uuencode,
}

/// Outcome of one article download
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArticleStatus {
    /// Not downloaded yet
    #[default]
    Pending,
    /// Downloaded and written (cache, temp file or direct-write region)
    Finished,
    /// Download or decode failed
    Failed,
    /// Article is not available on any server
    Missing,
}

/// Severity of a per-download message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Verbose progress information
    Detail,
    /// Informational message
    Info,
    /// Something went partially wrong
    Warning,
    /// An operation failed
    Error,
}

/// Human-readable status message recorded on a download
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    /// Severity
    pub kind: MessageKind,
    /// Message text
    pub text: String,
    /// When the message was recorded
    pub time: DateTime<Utc>,
}

/// Result of assembling a file from its segments
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    /// Every article was written
    Success,
    /// Some articles were missing or failed but the file was written
    Partial,
    /// The file could not be written
    Failed,
}

/// Event emitted by the writer engine
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A file was assembled and moved to its destination
    FileCompleted {
        /// Download ID
        id: DownloadId,
        /// File ID
        file_id: FileId,
        /// Final path of the artifact (None if it was removed or never written)
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
        /// Completion outcome
        status: CompletionStatus,
        /// CRC32 of the assembled file
        crc: u32,
    },

    /// Cached segments of a file were moved to disk by the background flusher
    CacheFlushed {
        /// Download ID
        id: DownloadId,
        /// File ID
        file_id: FileId,
        /// Number of segments written
        articles: usize,
        /// Bytes written
        bytes: u64,
    },

    /// Engine is shutting down
    Shutdown,
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_type_tag() {
        let event = Event::FileCompleted {
            id: DownloadId(7),
            file_id: FileId(3),
            path: None,
            status: CompletionStatus::Partial,
            crc: 0xdead_beef,
        };

        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "file_completed");
        assert_eq!(json["id"], 7);
        assert_eq!(json["status"], "partial");
        assert!(json.get("path").is_none(), "None path should be skipped");
    }

    #[test]
    fn ids_display_as_plain_numbers() {
        assert_eq!(DownloadId::new(42).to_string(), "42");
        assert_eq!(FileId(5).to_string(), "5");
        assert_eq!(DownloadId::from(9).get(), 9);
    }
}
