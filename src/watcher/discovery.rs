//! Transcript discovery
//!
//! Finds Claude Code transcripts under the projects directory.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::WatcherError;

/// Check if a path is a JSONL file
pub fn is_jsonl_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext == "jsonl")
        .unwrap_or(false)
}

/// Session id of a transcript: its file stem.
/// Path format: .../projects/<project>/<session_id>.jsonl
pub fn session_id_from_path(path: &Path) -> Option<String> {
    if !is_jsonl_file(path) {
        return None;
    }
    path.file_stem()?.to_str().map(|s| s.to_string())
}

/// All transcripts below `projects_dir`
pub fn list_transcripts(projects_dir: &Path) -> Result<Vec<PathBuf>, WatcherError> {
    if !projects_dir.exists() {
        return Err(WatcherError::PathNotFound(projects_dir.to_path_buf()));
    }

    let pattern = projects_dir.join("**").join("*.jsonl");
    let paths = glob::glob(&pattern.to_string_lossy())?
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::debug!("Skipping unreadable entry: {}", e);
                None
            }
        })
        .filter(|path| path.is_file())
        .collect();

    Ok(paths)
}

/// Most recently modified transcript below `projects_dir`
pub fn latest_transcript(projects_dir: &Path) -> Result<Option<PathBuf>, WatcherError> {
    let latest = list_transcripts(projects_dir)?
        .into_iter()
        .map(|path| {
            let modified = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, path)
        })
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, path)| path);

    if let Some(path) = &latest {
        tracing::debug!("Latest transcript: {:?}", path);
    }
    Ok(latest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File, FileTimes};
    use std::time::Duration;

    #[test]
    fn test_is_jsonl_file() {
        assert!(is_jsonl_file(Path::new("/path/to/session.jsonl")));
        assert!(!is_jsonl_file(Path::new("/path/to/session.json")));
        assert!(!is_jsonl_file(Path::new("/path/to/session.txt")));
    }

    #[test]
    fn test_session_id_from_path() {
        let path = PathBuf::from("/home/user/.claude/projects/-home-user-app/abc123.jsonl");
        assert_eq!(session_id_from_path(&path), Some("abc123".to_string()));
        assert_eq!(session_id_from_path(Path::new("/x/notes.txt")), None);
    }

    #[test]
    fn test_latest_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("-home-user-app");
        fs::create_dir_all(&project).unwrap();

        let old = project.join("old.jsonl");
        let new = project.join("new.jsonl");
        fs::write(&old, "{}\n").unwrap();
        fs::write(&new, "{}\n").unwrap();
        fs::write(project.join("ignored.txt"), "x").unwrap();

        let past = SystemTime::now() - Duration::from_secs(3600);
        File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_times(FileTimes::new().set_modified(past))
            .unwrap();

        assert_eq!(list_transcripts(dir.path()).unwrap().len(), 2);
        assert_eq!(latest_transcript(dir.path()).unwrap(), Some(new));
    }

    #[test]
    fn test_missing_projects_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            latest_transcript(&dir.path().join("nope")),
            Err(WatcherError::PathNotFound(_))
        ));
    }
}
