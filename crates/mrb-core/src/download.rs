//! Downloader port and the saver for media attached to chat messages.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::{
    classify::Route,
    messaging::{
        port::MessagingPort,
        types::{InboundMessage, Media},
    },
    utils::{move_file, non_clobbering_path, sanitize_filename, TempFile},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DownloadResult {
    Success {
        artifact_path: PathBuf,
        title: String,
        metadata: BTreeMap<String, String>,
    },
    Failure {
        reason: String,
    },
}

impl DownloadResult {
    pub fn success(artifact_path: impl Into<PathBuf>, title: impl Into<String>) -> Self {
        Self::Success {
            artifact_path: artifact_path.into(),
            title: title.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure {
            reason: reason.into(),
        }
    }

    /// Attach a metadata entry; no-op on failures.
    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        if let Self::Success { metadata, .. } = &mut self {
            metadata.insert(key.to_string(), value.into());
        }
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        match self {
            Self::Success { metadata, .. } => metadata.get(key).map(String::as_str),
            Self::Failure { .. } => None,
        }
    }
}

/// A site downloader. Implementations never return errors: every failure is
/// reported as `DownloadResult::Failure` with a human-readable reason.
#[async_trait]
pub trait Downloader: Send + Sync {
    fn name(&self) -> &'static str;

    async fn download(&self, url: &str) -> DownloadResult;
}

/// Downloaders wired for each link route. Missing entries mean the route is
/// recognised but not available in this build or configuration.
#[derive(Clone, Default)]
pub struct DownloaderSet {
    pub site_a: Option<Arc<dyn Downloader>>,
    pub site_b: Option<Arc<dyn Downloader>>,
    pub site_c: Option<Arc<dyn Downloader>>,
}

impl DownloaderSet {
    pub fn for_route(&self, route: Route) -> Option<&Arc<dyn Downloader>> {
        match route {
            Route::SiteA => self.site_a.as_ref(),
            Route::SiteB => self.site_b.as_ref(),
            Route::SiteC => self.site_c.as_ref(),
            Route::NativeMedia | Route::None => None,
        }
    }
}

// ============== Native Media ==============

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
    Photo,
    Other,
}

impl MediaKind {
    pub fn of(media: &Media) -> Self {
        match media {
            Media::Photo { .. } => Self::Photo,
            Media::Document {
                mime_type: Some(mime),
                ..
            } if mime.starts_with("video/") => Self::Video,
            Media::Document {
                mime_type: Some(mime),
                ..
            } if mime.starts_with("audio/") => Self::Audio,
            _ => Self::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Photo => "photo",
            Self::Other => "other",
        }
    }

    /// Subdirectory under `downloads/telegram`.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Video => "videos",
            Self::Audio => "audios",
            Self::Photo => "photos",
            Self::Other => "others",
        }
    }
}

/// Saves chat attachments into `downloads/telegram/<kind>`.
pub struct NativeMediaSaver {
    messenger: Arc<dyn MessagingPort>,
    temp_dir: PathBuf,
    dest_root: PathBuf,
}

impl NativeMediaSaver {
    pub fn new(messenger: Arc<dyn MessagingPort>, temp_dir: PathBuf, dest_root: PathBuf) -> Self {
        Self {
            messenger,
            temp_dir,
            dest_root,
        }
    }

    pub async fn save(&self, msg: &InboundMessage) -> DownloadResult {
        if msg.media.is_none() {
            return DownloadResult::failure("no media attached");
        }
        let kind = MediaKind::of(&msg.media);

        let downloaded = match self
            .messenger
            .download_media(&msg.media, &self.temp_dir)
            .await
        {
            Ok(p) => p,
            Err(e) => {
                warn!(chat_id = msg.chat_id().0, "media download failed: {e}");
                return DownloadResult::failure(format!("download failed: {e}"));
            }
        };
        // Removes the temp copy if the move below fails.
        let staged = TempFile::new(downloaded);

        let file_name = target_file_name(&msg.media, staged.path());
        let (stem, ext) = split_name(&file_name);
        let dest_dir = self.dest_root.join(kind.dir_name());
        let dest = non_clobbering_path(&dest_dir, &stem, &ext);

        match move_file(staged.path(), &dest).await {
            Ok(path) => {
                info!(kind = kind.as_str(), path = %path.display(), "media saved");
                DownloadResult::success(path, file_name).with_meta("type", kind.as_str())
            }
            Err(e) => DownloadResult::failure(format!("failed to move file: {e}")),
        }
    }
}

fn target_file_name(media: &Media, downloaded: &Path) -> String {
    match media {
        Media::Document {
            file_name: Some(name),
            ..
        } if !name.trim().is_empty() => sanitize_filename(name),
        Media::Document {
            mime_type: Some(mime),
            ..
        } if downloaded.extension().is_none() => {
            let ext = mime.rsplit('/').next().unwrap_or("bin");
            format!("untitled.{}", sanitize_filename(ext))
        }
        Media::Photo { .. } => format!("photo_{}.jpg", chrono::Local::now().format("%Y%m%d_%H%M%S")),
        _ => downloaded
            .file_name()
            .map(|n| sanitize_filename(&n.to_string_lossy()))
            .unwrap_or_else(|| "untitled".to_string()),
    }
}

fn split_name(name: &str) -> (String, String) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            (stem.to_string(), ext.to_string())
        }
        _ => (name.to_string(), String::new()),
    }
}
