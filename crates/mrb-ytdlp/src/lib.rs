//! yt-dlp adapter: site downloaders for YouTube, Douyin and Bilibili.
//!
//! Every site goes through the same runner, which spawns `yt-dlp`, reads one
//! JSON line per finished file from stdout (`--print after_move:`) and keeps a
//! bounded stderr tail for error reports.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::Mutex,
};
use tracing::{debug, warn};

use mrb_core::{
    config::Config,
    download::{Downloader, DownloaderSet},
    errors::Error,
    Result,
};

pub mod bilibili;
pub mod cookies;
pub mod douyin;
pub mod youtube;

pub use bilibili::BilibiliDownloader;
pub use douyin::DouyinDownloader;
pub use youtube::YoutubeDownloader;

const STDERR_TAIL_MAX_BYTES: usize = 16 * 1024;
const STDERR_TAIL_MAX_LINES: usize = 200;

/// Printed by yt-dlp once per file after all post-processing.
const FINISHED_TEMPLATE: &str = concat!(
    "after_move:{",
    r#""id":%(id)j,"title":%(title)j,"filepath":%(filepath)j,"#,
    r#""uploader":%(uploader)j,"playlist_title":%(playlist_title)j"#,
    "}"
);

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36";

/// One file yt-dlp finished writing.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct FinishedFile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub filepath: PathBuf,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub playlist_title: Option<String>,
}

#[derive(Debug, Default)]
pub struct RunOutput {
    pub files: Vec<FinishedFile>,
    /// `ERROR:` lines from stderr (one per failed item with `--ignore-errors`).
    pub errors: Vec<String>,
    pub exit_ok: bool,
    pub stderr_tail: String,
}

#[derive(Clone, Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
    bytes: usize,
    errors: Vec<String>,
}

impl StderrTail {
    fn push_line(&mut self, line: String) {
        if let Some(err) = line.strip_prefix("ERROR:") {
            self.errors.push(err.trim().to_string());
        }

        // +1 for the '\n' we join with later.
        self.bytes = self.bytes.saturating_add(line.len() + 1);
        self.lines.push_back(line);

        while self.lines.len() > STDERR_TAIL_MAX_LINES || self.bytes > STDERR_TAIL_MAX_BYTES {
            match self.lines.pop_front() {
                Some(front) => self.bytes = self.bytes.saturating_sub(front.len() + 1),
                None => break,
            }
        }
    }

    fn snapshot(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Runs the `yt-dlp` executable.
#[derive(Clone, Debug)]
pub struct YtDlp {
    program: PathBuf,
    proxy: Option<String>,
    timeout: Duration,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>, proxy: Option<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            proxy,
            timeout,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(
            cfg.ytdlp_path.clone(),
            cfg.proxy.as_ref().map(|p| p.url()),
            cfg.download_timeout,
        )
    }

    /// Arguments shared by every run, before the site-specific ones.
    fn base_args(&self, output_template: &Path) -> Vec<String> {
        let mut args = vec![
            "--no-simulate".to_string(),
            "--no-progress".to_string(),
            "--newline".to_string(),
            "--print".to_string(),
            FINISHED_TEMPLATE.to_string(),
            "-o".to_string(),
            output_template.to_string_lossy().to_string(),
        ];
        if let Some(proxy) = &self.proxy {
            args.push("--proxy".to_string());
            args.push(proxy.clone());
        }
        args
    }

    /// Download `url`, writing through `output_template`.
    ///
    /// Errors only when the process cannot be run or times out; a non-zero
    /// exit is reported in `RunOutput::exit_ok` so playlist runs keep their
    /// partial results. The child is killed if this future is dropped.
    pub async fn run(&self, url: &str, output_template: &Path, extra: &[String]) -> Result<RunOutput> {
        let mut args = self.base_args(output_template);
        args.extend(extra.iter().cloned());
        args.push("--".to_string());
        args.push(url.to_string());

        debug!(program = %self.program.display(), url, "spawning yt-dlp");
        match tokio::time::timeout(self.timeout, self.spawn_and_collect(&args)).await {
            Ok(res) => res,
            Err(_) => Err(Error::Download(format!(
                "yt-dlp timed out after {}s",
                self.timeout.as_secs()
            ))),
        }
    }

    async fn spawn_and_collect(&self, args: &[String]) -> Result<RunOutput> {
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Download(format!(
                    "failed to start {}: {e}",
                    self.program.display()
                ))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::External("yt-dlp stdout was not captured".to_string()))?;
        let stderr_tail = Arc::new(Mutex::new(StderrTail::default()));

        // Drain stderr in background to avoid blocking on a full pipe.
        let stderr_task = child.stderr.take().map(|stderr| {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut r = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = r.next_line().await {
                    tail.lock().await.push_line(line);
                }
            })
        });

        let mut files = Vec::new();
        let mut reader = BufReader::new(stdout).lines();
        while let Some(line) = reader.next_line().await? {
            match parse_finished(&line) {
                Some(f) => files.push(f),
                None if !line.trim().is_empty() => debug!(line = %line, "yt-dlp output"),
                None => {}
            }
        }

        let status = child.wait().await?;
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        let tail = stderr_tail.lock().await;
        Ok(RunOutput {
            files,
            errors: tail.errors.clone(),
            exit_ok: status.success(),
            stderr_tail: tail.snapshot(),
        })
    }
}

pub fn parse_finished(line: &str) -> Option<FinishedFile> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    match serde_json::from_str::<FinishedFile>(line) {
        Ok(f) if !f.filepath.as_os_str().is_empty() => Some(f),
        Ok(_) => None,
        Err(e) => {
            warn!("unparseable yt-dlp line: {e}");
            None
        }
    }
}

/// Best human-readable reason for a failed run.
pub fn failure_reason(out: &RunOutput) -> String {
    if let Some(last) = out.errors.last() {
        return last.clone();
    }
    let tail = out.stderr_tail.trim();
    if tail.is_empty() {
        "yt-dlp produced no file".to_string()
    } else {
        mrb_core::formatting::truncate_text(tail, 800)
    }
}

/// Files in `dir` belonging to a download with `id` (yt-dlp keeps the id in
/// the name), skipping partial downloads.
pub(crate) fn files_for_id(dir: &Path, id: &str) -> Vec<PathBuf> {
    if id.is_empty() {
        return Vec::new();
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut out: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            let name = p.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
            name.contains(id) && !name.ends_with(".part") && !name.ends_with(".ytdl")
        })
        .collect();
    out.sort();
    out
}

pub(crate) fn extension(p: &Path) -> String {
    p.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Wire every site downloader from configuration.
pub fn downloaders(cfg: &Config) -> Result<DownloaderSet> {
    let ytdlp = Arc::new(YtDlp::from_config(cfg));
    let dirs = &cfg.dirs;

    let youtube: Arc<dyn Downloader> = Arc::new(YoutubeDownloader::new(
        ytdlp.clone(),
        cfg.youtube.clone(),
        dirs.temp("youtube"),
        dirs.youtube(),
        dirs.audios(),
    ));
    let douyin: Arc<dyn Downloader> = Arc::new(DouyinDownloader::new(
        ytdlp.clone(),
        cfg.douyin_cookie.clone(),
        dirs.temp("douyin"),
        dirs.douyin(),
    ));
    let bilibili: Arc<dyn Downloader> = Arc::new(BilibiliDownloader::new(
        ytdlp,
        cfg.bilibili_cookie.clone(),
        cfg.proxy.as_ref().map(|p| p.url()),
        dirs.temp("bilibili"),
        dirs.bilibili(),
    )?);

    Ok(DownloaderSet {
        site_a: Some(youtube),
        site_b: Some(douyin),
        site_c: Some(bilibili),
    })
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_tail_is_bounded_and_keeps_errors() {
        let mut tail = StderrTail::default();
        for i in 0..500 {
            tail.push_line(format!("line {i}"));
        }
        tail.push_line("ERROR: [youtube] abc: Video unavailable".to_string());
        assert!(tail.lines.len() <= STDERR_TAIL_MAX_LINES);
        assert!(tail.snapshot().ends_with("Video unavailable"));
        assert_eq!(tail.errors, vec!["[youtube] abc: Video unavailable".to_string()]);
    }

    #[test]
    fn finished_lines_parse_with_nulls() {
        let f = parse_finished(
            r#"{"id":"abc","title":"T","filepath":"/tmp/x.mp4","uploader":null,"playlist_title":null}"#,
        )
        .unwrap();
        assert_eq!(f.id, "abc");
        assert_eq!(f.filepath, PathBuf::from("/tmp/x.mp4"));
        assert!(f.uploader.is_none());

        assert!(parse_finished("[download] 100%").is_none());
        assert!(parse_finished("{not json").is_none());
    }

    #[test]
    fn files_for_id_skips_partials() {
        let dir = test_support::scratch_dir("files");
        for name in ["a-abc.mp4", "a-abc.mp3", "a-abc.mp4.part", "other.mp4"] {
            std::fs::write(dir.join(name), b"x").unwrap();
        }
        let found = files_for_id(&dir, "abc");
        assert_eq!(found, vec![dir.join("a-abc.mp3"), dir.join("a-abc.mp4")]);
        assert!(files_for_id(&dir, "").is_empty());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runner_collects_files_and_errors() {
        let dir = test_support::scratch_dir("runner");
        let program = test_support::fake_ytdlp(
            &dir,
            r#"{"id":"x1","title":"One","filepath":"/tmp/one.mp4","uploader":"u","playlist_title":"P"}"#,
            "WARNING: slow\nERROR: [youtube] x2: Private video",
            1,
        );
        let ytdlp = YtDlp::new(program, None, Duration::from_secs(10));

        let out = ytdlp
            .run("https://youtu.be/x", &dir.join("%(id)s.%(ext)s"), &[])
            .await
            .unwrap();
        assert!(!out.exit_ok);
        assert_eq!(out.files.len(), 1);
        assert_eq!(out.files[0].playlist_title.as_deref(), Some("P"));
        assert_eq!(failure_reason(&out), "[youtube] x2: Private video");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn missing_binary_is_a_download_error() {
        let ytdlp = YtDlp::new("/nonexistent/yt-dlp", None, Duration::from_secs(5));
        let err = ytdlp
            .run("https://youtu.be/x", Path::new("/tmp/%(id)s"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Download(_)));
    }

    #[test]
    fn proxy_is_passed_when_configured() {
        let ytdlp = YtDlp::new("yt-dlp", Some("socks5://127.0.0.1:7890".to_string()), Duration::from_secs(1));
        let args = ytdlp.base_args(Path::new("/tmp/%(id)s.%(ext)s"));
        let i = args.iter().position(|a| a == "--proxy").unwrap();
        assert_eq!(args[i + 1], "socks5://127.0.0.1:7890");
    }
}
