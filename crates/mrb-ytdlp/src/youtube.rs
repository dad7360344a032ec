use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use tracing::{info, warn};

use mrb_core::{
    config::YoutubeSettings,
    download::{DownloadResult, Downloader},
    utils::{move_file, non_clobbering_path, sanitize_filename, TempFile},
};

use crate::{cookies, extension, failure_reason, files_for_id, FinishedFile, RunOutput, YtDlp};

const AUDIO_EXTENSIONS: [&str; 6] = ["mp3", "m4a", "ogg", "wav", "flac", "opus"];
const BOT_CHECK: &str = "Sign in to confirm you're not a bot";
const MAX_LISTED_FAILURES: usize = 10;

pub struct YoutubeDownloader {
    ytdlp: Arc<YtDlp>,
    settings: YoutubeSettings,
    temp_dir: PathBuf,
    video_dir: PathBuf,
    audio_dir: PathBuf,
}

impl YoutubeDownloader {
    pub fn new(
        ytdlp: Arc<YtDlp>,
        settings: YoutubeSettings,
        temp_dir: PathBuf,
        video_dir: PathBuf,
        audio_dir: PathBuf,
    ) -> Self {
        Self {
            ytdlp,
            settings,
            temp_dir,
            video_dir,
            audio_dir,
        }
    }

    fn args(&self, playlist: bool, cookie_file: Option<&TempFile>) -> Vec<String> {
        let mut args = vec![
            "-f".to_string(),
            self.settings.format.clone(),
            "--merge-output-format".to_string(),
            "mp4".to_string(),
            "--recode-video".to_string(),
            "mp4".to_string(),
            "--restrict-filenames".to_string(),
            "--windows-filenames".to_string(),
        ];
        if let Some(fmt) = &self.settings.audio_format {
            args.extend([
                "-x".to_string(),
                "--audio-format".to_string(),
                fmt.clone(),
                "--audio-quality".to_string(),
                "192K".to_string(),
                // keep the video next to the extracted audio
                "-k".to_string(),
            ]);
        }
        if playlist {
            args.extend(["--yes-playlist".to_string(), "--ignore-errors".to_string()]);
        } else {
            args.push("--no-playlist".to_string());
        }
        if let Some(jar) = cookie_file {
            args.push("--cookies".to_string());
            args.push(jar.path().to_string_lossy().to_string());
        }
        args
    }

    /// Move every file of one finished video out of the temp dir.
    async fn collect(&self, finished: &FinishedFile) -> Vec<PathBuf> {
        let title = finished.title.as_deref().unwrap_or(&finished.id);
        let stem = sanitize_filename(title);

        let mut sources = files_for_id(&self.temp_dir, &finished.id);
        if sources.is_empty() && finished.filepath.exists() {
            sources.push(finished.filepath.clone());
        }

        let mut moved = Vec::new();
        for src in sources {
            let ext = extension(&src);
            let dir = if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
                &self.audio_dir
            } else {
                &self.video_dir
            };
            let dest = non_clobbering_path(dir, &stem, &ext);
            match move_file(&src, &dest).await {
                Ok(p) => moved.push(p),
                Err(e) => warn!(src = %src.display(), "failed to move download: {e}"),
            }
        }
        moved
    }

    /// The audio file when conversion is on, else the first file.
    fn primary(&self, files: &[PathBuf]) -> Option<PathBuf> {
        if let Some(fmt) = &self.settings.audio_format {
            if let Some(audio) = files.iter().find(|p| extension(p) == fmt.to_lowercase()) {
                return Some(audio.clone());
            }
        }
        files
            .iter()
            .find(|p| !AUDIO_EXTENSIONS.contains(&extension(p).as_str()))
            .or_else(|| files.first())
            .cloned()
    }

    async fn single(&self, out: RunOutput) -> DownloadResult {
        let Some(finished) = out.files.first() else {
            return failure(&out);
        };
        let files = self.collect(finished).await;
        let Some(path) = self.primary(&files) else {
            return DownloadResult::failure("downloaded file not found");
        };
        let title = finished.title.clone().unwrap_or_else(|| finished.id.clone());
        info!(title = %title, path = %path.display(), "youtube download finished");
        DownloadResult::success(path, title).with_meta("video_id", finished.id.clone())
    }

    async fn playlist(&self, out: RunOutput) -> DownloadResult {
        if out.files.is_empty() {
            return failure(&out);
        }

        let mut ok = 0usize;
        let mut seen: Vec<&str> = Vec::new();
        for f in &out.files {
            // With -k the same video may print once per kept file.
            if seen.contains(&f.id.as_str()) {
                continue;
            }
            seen.push(f.id.as_str());
            if !self.collect(f).await.is_empty() {
                ok += 1;
            }
        }

        let title = out
            .files
            .iter()
            .find_map(|f| f.playlist_title.clone())
            .unwrap_or_else(|| "playlist".to_string());
        let summary = playlist_summary(&title, ok, &out.errors);
        info!(playlist = %title, ok, failed = out.errors.len(), "youtube playlist finished");

        DownloadResult::success(self.video_dir.clone(), title)
            .with_meta("summary", summary)
            .with_meta("succeeded", ok.to_string())
            .with_meta("failed", out.errors.len().to_string())
    }
}

#[async_trait]
impl Downloader for YoutubeDownloader {
    fn name(&self) -> &'static str {
        "youtube"
    }

    async fn download(&self, url: &str) -> DownloadResult {
        let url = normalize_url(url);
        let playlist = is_playlist(&url);

        let jar = match self.settings.cookies.as_deref() {
            Some(raw) => match cookies::write_jar(&self.temp_dir, ".youtube.com", raw).await {
                Ok(guard) => Some(guard),
                Err(e) => return DownloadResult::failure(format!("cannot write cookie file: {e}")),
            },
            None => None,
        };

        let template = self.temp_dir.join("%(title).100s-%(id)s.%(ext)s");
        let out = match self
            .ytdlp
            .run(&url, &template, &self.args(playlist, jar.as_ref()))
            .await
        {
            Ok(out) => out,
            Err(e) => return DownloadResult::failure(e.to_string()),
        };
        drop(jar);

        if playlist {
            self.playlist(out).await
        } else {
            self.single(out).await
        }
    }
}

pub fn normalize_url(url: &str) -> String {
    url.trim().replace("m.youtube.com", "www.youtube.com")
}

pub fn is_playlist(url: &str) -> bool {
    url.contains("list=") || url.trim_end_matches('/').ends_with("/videos")
}

fn failure(out: &RunOutput) -> DownloadResult {
    let reason = failure_reason(out);
    if reason.contains(BOT_CHECK) {
        return DownloadResult::failure(
            "YouTube asked for sign-in verification. Check youtube_download.cookies in the config file.",
        );
    }
    DownloadResult::failure(reason)
}

pub fn playlist_summary(title: &str, ok: usize, errors: &[String]) -> String {
    let total = ok + errors.len();
    let mut s = format!(
        "📋 Playlist {title} finished\nTotal: {total}\n✅ Succeeded: {ok}\n❌ Failed: {}",
        errors.len()
    );
    if !errors.is_empty() {
        s.push_str("\n\nFailures:");
        for e in errors.iter().take(MAX_LISTED_FAILURES) {
            s.push_str(&format!("\n- {e}"));
        }
        if errors.len() > MAX_LISTED_FAILURES {
            s.push_str(&format!("\n...{} failures in total", errors.len()));
        }
    }
    s
}
