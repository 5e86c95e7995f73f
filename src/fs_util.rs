use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::IngestError;

/// Reads a JSON document, yielding `None` when the file is absent or malformed.
pub async fn read_json_soft<T: DeserializeOwned>(path: &Utf8Path) -> Option<T> {
    let content = match tokio::fs::read(path.as_std_path()).await {
        Ok(content) => content,
        Err(_) => return None,
    };
    match serde_json::from_slice(&content) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(path = %path, error = %err, "ignoring malformed JSON file");
            None
        }
    }
}

/// Like [`read_json_soft`], but a file that exists and cannot be parsed is an error.
pub async fn read_json_document<T: DeserializeOwned>(
    path: &Utf8Path,
    kind: &'static str,
) -> Result<T, IngestError> {
    if !tokio::fs::try_exists(path.as_std_path()).await.unwrap_or(false) {
        return Err(IngestError::MissingFile(path.to_path_buf()));
    }
    read_json_soft(path)
        .await
        .ok_or_else(|| IngestError::InvalidDocument {
            kind,
            path: path.to_path_buf(),
        })
}

/// Writes `value` next to `path` and renames it into place on a blocking thread.
pub async fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), IngestError> {
    let parent = path
        .parent()
        .ok_or_else(|| IngestError::Filesystem("invalid destination path".to_string()))?
        .to_path_buf();
    let content =
        serde_json::to_vec_pretty(value).map_err(|err| IngestError::Filesystem(err.to_string()))?;
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut temp = tempfile::Builder::new()
            .prefix(".mdingest")
            .tempfile_in(parent.as_std_path())?;
        std::io::Write::write_all(&mut temp, &content)?;
        temp.persist(path.as_std_path())?;
        Ok::<_, std::io::Error>(())
    })
    .await
    .map_err(|err| IngestError::Filesystem(err.to_string()))?
    .map_err(|err| IngestError::Filesystem(err.to_string()))
}

pub async fn remove_file_if_exists(path: &Utf8Path) -> Result<(), IngestError> {
    match tokio::fs::remove_file(path.as_std_path()).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(IngestError::Filesystem(err.to_string())),
    }
}

/// Lists the regular files and directories directly under `root`, sorted by name.
pub async fn list_dir(
    root: &Utf8Path,
) -> Result<(Vec<Utf8PathBuf>, Vec<Utf8PathBuf>), IngestError> {
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    let mut entries = tokio::fs::read_dir(root.as_std_path())
        .await
        .map_err(|err| IngestError::Filesystem(format!("read dir {root}: {err}")))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| IngestError::Filesystem(err.to_string()))?
    {
        let path = Utf8PathBuf::from_path_buf(entry.path())
            .map_err(|_| IngestError::Filesystem("non-utf8 file path in project".to_string()))?;
        if path.file_name().map(|name| name.starts_with('.')).unwrap_or(true) {
            continue;
        }
        // Follows symlinks, like `Path::is_dir`.
        let Ok(metadata) = tokio::fs::metadata(path.as_std_path()).await else {
            continue;
        };
        if metadata.is_dir() {
            dirs.push(path);
        } else if metadata.is_file() {
            files.push(path);
        }
    }
    files.sort();
    dirs.sort();
    Ok((files, dirs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn soft_read_ignores_missing_and_malformed() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();

        let missing: Option<serde_json::Value> = read_json_soft(&root.join("none.json")).await;
        assert!(missing.is_none());

        std::fs::write(root.join("bad.json"), b"{ nope").unwrap();
        let bad: Option<serde_json::Value> = read_json_soft(&root.join("bad.json")).await;
        assert!(bad.is_none());

        let err = read_json_document::<serde_json::Value>(&root.join("bad.json"), "metadata")
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::InvalidDocument { .. }));
    }

    #[tokio::test]
    async fn atomic_write_replaces_content() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let path = root.join("doc.json");
        write_json_atomic(&path, &serde_json::json!({ "a": 1 })).await.unwrap();
        write_json_atomic(&path, &serde_json::json!({ "a": 2 })).await.unwrap();
        let content = std::fs::read_to_string(path.as_std_path()).unwrap();
        assert!(content.contains('2'));
        let (files, dirs) = list_dir(&root).await.unwrap();
        assert_eq!(files, vec![path]);
        assert!(dirs.is_empty());
    }

    #[tokio::test]
    async fn listing_skips_hidden_entries_and_sorts() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        std::fs::write(root.join("b.txt"), b"b").unwrap();
        std::fs::write(root.join("a.txt"), b"a").unwrap();
        std::fs::write(root.join(".hidden"), b"h").unwrap();
        std::fs::create_dir(root.join("run")).unwrap();
        std::fs::create_dir(root.join(".cache")).unwrap();

        let (files, dirs) = list_dir(&root).await.unwrap();
        assert_eq!(files, vec![root.join("a.txt"), root.join("b.txt")]);
        assert_eq!(dirs, vec![root.join("run")]);

        remove_file_if_exists(&root.join("a.txt")).await.unwrap();
        remove_file_if_exists(&root.join("a.txt")).await.unwrap();
        assert!(!root.join("a.txt").exists());
    }
}
