//! Cookie strings from the config file, in the forms yt-dlp accepts.

use std::path::Path;

use mrb_core::{
    utils::{unique_suffix, TempFile},
    Result,
};

/// `name=value` pairs from a `Cookie:` header style string.
pub fn pairs(raw: &str) -> Vec<(&str, &str)> {
    raw.split(';')
        .filter_map(|c| c.trim().split_once('='))
        .map(|(n, v)| (n.trim(), v.trim()))
        .filter(|(n, _)| !n.is_empty())
        .collect()
}

/// Netscape cookie-jar text for `domain`, one line per cookie.
pub fn netscape_jar(domain: &str, raw: &str) -> String {
    let mut out = String::from(
        "# Netscape HTTP Cookie File\n# This is a generated file! Do not edit.\n\n",
    );
    for (name, value) in pairs(raw) {
        out.push_str(&format!(
            "{domain}\tTRUE\t/\tTRUE\t2999999999\t{name}\t{value}\n"
        ));
    }
    out
}

/// Write a cookie jar into `dir`; the file is deleted when the guard drops.
pub async fn write_jar(dir: &Path, domain: &str, raw: &str) -> Result<TempFile> {
    tokio::fs::create_dir_all(dir).await?;
    let guard = TempFile::new(dir.join(format!("cookies_{}.txt", unique_suffix())));
    tokio::fs::write(guard.path(), netscape_jar(domain, raw)).await?;
    Ok(guard)
}

/// `--add-header Cookie:...` arguments, or nothing when no cookie is set.
pub fn header_args(raw: Option<&str>) -> Vec<String> {
    match raw.map(str::trim) {
        Some(c) if !c.is_empty() => vec!["--add-header".to_string(), format!("Cookie:{c}")],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jar_has_one_line_per_cookie() {
        let jar = netscape_jar(".youtube.com", "SID=abc; HSID = def ;junk; =x");
        let lines: Vec<&str> = jar.lines().filter(|l| !l.starts_with('#') && !l.is_empty()).collect();
        assert_eq!(
            lines,
            vec![
                ".youtube.com\tTRUE\t/\tTRUE\t2999999999\tSID\tabc",
                ".youtube.com\tTRUE\t/\tTRUE\t2999999999\tHSID\tdef",
            ]
        );
    }

    #[tokio::test]
    async fn jar_file_is_removed_with_its_guard() {
        let dir = crate::test_support::scratch_dir("cookies");
        let path = {
            let guard = write_jar(&dir, ".youtube.com", "SID=1").await.unwrap();
            assert!(guard.path().exists());
            guard.path().to_path_buf()
        };
        assert!(!path.exists());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn header_args_skip_blank_cookies() {
        assert!(header_args(None).is_empty());
        assert!(header_args(Some("  ")).is_empty());
        assert_eq!(header_args(Some("a=1")), vec!["--add-header", "Cookie:a=1"]);
    }
}
