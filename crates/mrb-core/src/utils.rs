use std::{
    io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
};

use regex::Regex;
use tracing::warn;

use crate::Result;

static UNIQUE_COUNTER: AtomicUsize = AtomicUsize::new(1);

// ============== File Names ==============

/// Replace characters that are illegal on common filesystems and collapse whitespace.
pub fn sanitize_filename(name: &str) -> String {
    static WS: std::sync::OnceLock<Option<Regex>> = std::sync::OnceLock::new();

    let replaced: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_whitespace() => ' ',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let collapsed = match WS.get_or_init(|| Regex::new(r"\s+").ok()) {
        Some(re) => re.replace_all(&replaced, " ").into_owned(),
        None => replaced,
    };

    let out = collapsed.trim().trim_matches('.').to_string();
    if out.is_empty() {
        "untitled".to_string()
    } else {
        out
    }
}

/// `<millis>_<counter>`, unique within the process.
pub fn unique_suffix() -> String {
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let n = UNIQUE_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("{ts}_{n}")
}

// ============== Directories / Moves ==============

pub fn ensure_dirs<P: AsRef<Path>>(dirs: &[P]) -> Result<()> {
    for d in dirs {
        std::fs::create_dir_all(d.as_ref())?;
    }
    Ok(())
}

/// Move `src` to `dst`, creating the parent directory.
///
/// Falls back to copy + remove when a plain rename crosses filesystems.
pub async fn move_file(src: &Path, dst: &Path) -> Result<PathBuf> {
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    match tokio::fs::rename(src, dst).await {
        Ok(()) => Ok(dst.to_path_buf()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(e.into()),
        Err(_) => {
            tokio::fs::copy(src, dst).await?;
            tokio::fs::remove_file(src).await?;
            Ok(dst.to_path_buf())
        }
    }
}

/// Pick `dir/stem.ext`, or `dir/stem (n).ext` when that name is taken.
pub fn non_clobbering_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    let file = |suffix: String| {
        if ext.is_empty() {
            format!("{stem}{suffix}")
        } else {
            format!("{stem}{suffix}.{ext}")
        }
    };

    let first = dir.join(file(String::new()));
    if !first.exists() {
        return first;
    }
    for n in 1..1000 {
        let p = dir.join(file(format!(" ({n})")));
        if !p.exists() {
            return p;
        }
    }
    dir.join(file(format!(" ({})", unique_suffix())))
}

// ============== Transient Files ==============

/// A file that is removed when the guard is dropped.
///
/// Covers every exit path of the code holding it: success, error, and the
/// owning task being cancelled mid-await.
#[derive(Debug)]
pub struct TempFile {
    path: PathBuf,
}

impl TempFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), "failed to remove temp file: {e}"),
        }
    }
}
