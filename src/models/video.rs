//! Video entity model and related types.
//!
//! A `Video` is the product of a completed upload session: the assembled
//! original plus the metadata and thumbnail the post-processing worker
//! derives from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for deriving video ids from session ids.
///
/// `Uuid::new_v5(VIDEO_NAMESPACE, session_id)` gives every session exactly
/// one video id, so assembly redelivery can check-and-skip instead of
/// creating duplicates.
pub const VIDEO_NAMESPACE: Uuid = Uuid::from_bytes([
    0x8f, 0x1c, 0x2a, 0x40, 0x5d, 0x31, 0x4e, 0x9b, 0x92, 0x7a, 0x63, 0x0e, 0xc4, 0xd1, 0x55,
    0x21,
]);

/// Video lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoState {
    /// Assembled, awaiting probe and thumbnail
    Processing,
    /// Fully processed and streamable
    Ready,
    /// Probe or thumbnail generation failed
    Failed,
}

impl VideoState {
    /// Convert to database string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    /// Parse from database string representation
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(Self::Processing),
            "ready" => Some(Self::Ready),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Video entity representing one assembled upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Video {
    /// Unique identifier, derived from the producing session
    pub id: Uuid,

    /// Opaque id of the owning user
    pub owner: String,

    /// Display title
    pub title: String,

    /// Description text
    pub description: String,

    /// Tag list
    pub tags: Vec<String>,

    /// Category name
    pub category: String,

    /// MIME type of the original
    pub mime_type: String,

    /// Blob store key of the assembled original, `uploads/{target_filename}`
    pub storage_key: String,

    /// Blob store key of the thumbnail; empty until post-processing succeeds
    pub thumbnail_key: String,

    /// Duration in seconds, filled by the prober
    pub duration_s: f64,

    /// Resolution as `WxH`, filled by the prober
    pub resolution: String,

    /// Codec name, filled by the prober
    pub codec: String,

    /// Size of the assembled original in bytes
    pub file_size: u64,

    /// Bitrate in bits per second, filled by the prober
    pub bitrate: u64,

    /// Lifecycle state
    pub state: VideoState,

    /// View counter, non-decreasing
    pub views: u64,

    /// Like counter, non-decreasing
    pub likes: u64,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Video {
    /// Derive the video id for a session
    pub fn id_for_session(session_id: Uuid) -> Uuid {
        Uuid::new_v5(&VIDEO_NAMESPACE, session_id.as_bytes())
    }

    /// Create a video row in state `Processing` from session metadata
    pub fn from_session_metadata(
        session_id: Uuid,
        owner: String,
        title: String,
        metadata: &std::collections::BTreeMap<String, String>,
        storage_key: String,
    ) -> Self {
        let now = Utc::now();
        let tags = metadata
            .get("tags")
            .map(|t| {
                t.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            id: Self::id_for_session(session_id),
            owner,
            title,
            description: metadata.get("description").cloned().unwrap_or_default(),
            tags,
            category: metadata
                .get("category")
                .filter(|c| !c.is_empty())
                .cloned()
                .unwrap_or_else(|| "general".to_string()),
            mime_type: metadata
                .get("mime_type")
                .filter(|m| !m.is_empty())
                .cloned()
                .unwrap_or_else(|| "video/mp4".to_string()),
            storage_key,
            thumbnail_key: String::new(),
            duration_s: 0.0,
            resolution: String::new(),
            codec: String::new(),
            file_size: 0,
            bitrate: 0,
            state: VideoState::Processing,
            views: 0,
            likes: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply probe output and the thumbnail key, transitioning to `Ready`
    pub fn apply_probe(&mut self, probe: &ProbeResult, thumbnail_key: String) {
        self.duration_s = probe.duration_s;
        self.resolution = probe.resolution.clone();
        self.codec = probe.codec.clone();
        self.file_size = probe.file_size;
        self.bitrate = probe.bitrate;
        self.thumbnail_key = thumbnail_key;
        self.state = VideoState::Ready;
        self.updated_at = Utc::now();
    }

    /// Mark the video as failed
    pub fn mark_failed(&mut self) {
        self.state = VideoState::Failed;
        self.updated_at = Utc::now();
    }
}

/// Output of probing an assembled blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Duration in seconds
    pub duration_s: f64,
    /// Resolution as `WxH`
    pub resolution: String,
    /// Codec name of the primary video stream
    pub codec: String,
    /// File size in bytes
    pub file_size: u64,
    /// Overall bitrate in bits per second
    pub bitrate: u64,
}

/// Response DTO for video details (admin API)
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInfoResponse {
    pub id: Uuid,
    pub owner: String,
    pub title: String,
    pub category: String,
    pub mime_type: String,
    pub storage_key: String,
    pub thumbnail_key: String,
    pub duration_s: f64,
    pub resolution: String,
    pub codec: String,
    pub file_size: u64,
    pub bitrate: u64,
    pub state: VideoState,
    pub views: u64,
    pub likes: u64,
    pub created_at: DateTime<Utc>,
}

impl VideoInfoResponse {
    pub fn from_video(video: &Video) -> Self {
        Self {
            id: video.id,
            owner: video.owner.clone(),
            title: video.title.clone(),
            category: video.category.clone(),
            mime_type: video.mime_type.clone(),
            storage_key: video.storage_key.clone(),
            thumbnail_key: video.thumbnail_key.clone(),
            duration_s: video.duration_s,
            resolution: video.resolution.clone(),
            codec: video.codec.clone(),
            file_size: video.file_size,
            bitrate: video.bitrate,
            state: video.state,
            views: video.views,
            likes: video.likes,
            created_at: video.created_at,
        }
    }
}
