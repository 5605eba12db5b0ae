//! Upstream media objects as reported by the front-end.
//!
//! Each kind carries only the fields needed to build a [`FileEntry`]. Kinds
//! the relay does not know about deserialize into [`MediaDescriptor::Unsupported`].

use crate::mime::MimeResolver;
use crate::registry::FileEntry;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaDescriptor {
    Video {
        object_id: String,
        size_bytes: u64,
        #[serde(default)]
        file_name: Option<String>,
        #[serde(default)]
        mime_type: Option<String>,
    },
    Document {
        object_id: String,
        size_bytes: u64,
        #[serde(default)]
        file_name: Option<String>,
        #[serde(default)]
        mime_type: Option<String>,
    },
    Audio {
        object_id: String,
        size_bytes: u64,
        #[serde(default)]
        file_name: Option<String>,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        mime_type: Option<String>,
    },
    Voice {
        object_id: String,
        size_bytes: u64,
        #[serde(default)]
        mime_type: Option<String>,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("unsupported media kind")]
    Unsupported,

    #[error("media object id is empty")]
    MissingObjectId,
}

impl MediaDescriptor {
    pub fn kind(&self) -> &'static str {
        match self {
            MediaDescriptor::Video { .. } => "video",
            MediaDescriptor::Document { .. } => "document",
            MediaDescriptor::Audio { .. } => "audio",
            MediaDescriptor::Voice { .. } => "voice",
            MediaDescriptor::Unsupported => "unsupported",
        }
    }

    pub fn into_file_entry(self, resolver: &MimeResolver) -> Result<FileEntry, MediaError> {
        let (object_id, size_bytes, display_name, mime_type) = match self {
            MediaDescriptor::Video {
                object_id,
                size_bytes,
                file_name,
                mime_type,
            } => (
                object_id,
                size_bytes,
                non_empty(file_name).unwrap_or_else(|| "video.mp4".into()),
                mime_type,
            ),
            MediaDescriptor::Document {
                object_id,
                size_bytes,
                file_name,
                mime_type,
            } => (
                object_id,
                size_bytes,
                non_empty(file_name).unwrap_or_else(|| "file".into()),
                mime_type,
            ),
            MediaDescriptor::Audio {
                object_id,
                size_bytes,
                file_name,
                title,
                mime_type,
            } => {
                let name = non_empty(file_name)
                    .or_else(|| non_empty(title).map(|title| format!("{title}.mp3")))
                    .unwrap_or_else(|| "audio.mp3".into());
                (object_id, size_bytes, name, mime_type)
            }
            MediaDescriptor::Voice {
                object_id,
                size_bytes,
                mime_type,
            } => (
                object_id,
                size_bytes,
                "voice.ogg".into(),
                mime_type.or_else(|| Some("audio/ogg".into())),
            ),
            MediaDescriptor::Unsupported => return Err(MediaError::Unsupported),
        };

        if object_id.trim().is_empty() {
            return Err(MediaError::MissingObjectId);
        }

        let mime_type = resolver.resolve_or(&display_name, mime_type.as_deref());
        Ok(FileEntry {
            object_id,
            display_name,
            size_bytes,
            mime_type,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
