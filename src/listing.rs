use crate::model::FileEntry;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::warn;
use walkdir::WalkDir;

/// Lists the downloadable files directly inside `dir`, newest first.
///
/// Hidden files and files whose extension is not in `allowed_extensions`
/// (compared case-insensitively) are skipped. An empty allow-list admits
/// every extension.
pub fn list_files(dir: &Path, allowed_extensions: &[String]) -> std::io::Result<Vec<FileEntry>> {
    if !dir.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Invalid directory: {:?}", dir),
        ));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if name.starts_with('.') || !entry.file_type().is_file() {
            continue;
        }
        if !extension_allowed(path, allowed_extensions) {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!("Failed to get stats for file {:?}: {}", path, e);
                continue;
            }
        };
        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        files.push(FileEntry {
            name: name.to_string(),
            path: name.to_string(),
            size: metadata.len(),
            modified,
        });
    }

    files.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.name.cmp(&b.name)));
    Ok(files)
}

fn extension_allowed(path: &Path, allowed_extensions: &[String]) -> bool {
    if allowed_extensions.is_empty() {
        return true;
    }
    let Some(ext) = path.extension().and_then(|s| s.to_str()) else {
        return false;
    };
    allowed_extensions
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(ext))
}

/// Joins a client supplied relative path onto `root`, refusing anything that
/// could climb out of it.
pub fn resolve(root: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return None;
    }
    let joined = root.join(relative);
    joined.starts_with(root).then_some(joined)
}

/// Percent-encodes each segment of a `/`-separated path for use in a URL.
pub fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| utf8_percent_encode(segment, NON_ALPHANUMERIC).to_string())
        .collect::<Vec<_>>()
        .join("/")
}
