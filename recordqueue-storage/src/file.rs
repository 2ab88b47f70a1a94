//! Small file utilities shared by segment and metadata handling.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

/// Suffix of files that are being written and not yet renamed into place.
pub const TEMP_SUFFIX: &str = "tmp";

/// Deletes `path`, logging instead of failing.
///
/// Returns `true` if the file is gone afterwards, including when it did not exist.
pub async fn delete_file_warn_if_failed(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(err) if err.kind() == ErrorKind::NotFound => true,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to delete file");
            false
        }
    }
}

/// Deletes every regular file in `directory` whose name satisfies `predicate`.
///
/// Returns `false` if any deletion failed. A missing directory is treated as empty.
pub async fn delete_files_warn_if_failed<F>(directory: &Path, mut predicate: F) -> bool
where
    F: FnMut(&str) -> bool,
{
    let mut entries = match tokio::fs::read_dir(directory).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return true,
        Err(err) => {
            tracing::warn!(directory = %directory.display(), error = %err, "failed to list directory");
            return false;
        }
    };

    let mut all_deleted = true;
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(directory = %directory.display(), error = %err, "failed to list directory");
                return false;
            }
        };

        let is_file = entry.file_type().await.is_ok_and(|ty| ty.is_file());
        let matches = entry.file_name().to_str().is_some_and(&mut predicate);
        if is_file && matches {
            all_deleted &= delete_file_warn_if_failed(&entry.path()).await;
        }
    }

    all_deleted
}

/// Returns the temporary sibling used while `path` is being replaced.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(TEMP_SUFFIX);
    path.with_file_name(name)
}

/// Atomically replaces the contents of `path` with `contents`.
///
/// The data is written to a temporary sibling, synced, and renamed over `path`.
pub async fn write_file_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let temp = temp_path(path);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp)
        .await?;

    let result = async {
        file.write_all(contents).await?;
        file.sync_data().await
    }
    .await;
    drop(file);

    if let Err(err) = result {
        delete_file_warn_if_failed(&temp).await;
        return Err(err);
    }

    tokio::fs::rename(&temp, path).await?;
    sync_directory(path).await;
    Ok(())
}

/// Reads the whole file at `path`, returning `None` if it does not exist.
pub async fn read_file_if_exists(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Makes renames and creations in the parent directory of `path` durable.
///
/// Failures are logged. Some platforms do not support syncing directories.
pub async fn sync_directory(path: &Path) {
    let Some(parent) = path.parent() else {
        return;
    };

    #[cfg(unix)]
    {
        let result = async { tokio::fs::File::open(parent).await?.sync_all().await }.await;
        if let Err(err) = result {
            tracing::debug!(directory = %parent.display(), error = %err, "failed to sync directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn atomic_write_replaces_contents() {
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join("queue.meta");

        write_file_atomic(&path, b"first").await.unwrap();
        write_file_atomic(&path, b"second").await.unwrap();

        let contents = read_file_if_exists(&path).await.unwrap();
        assert_eq!(contents.as_deref(), Some(&b"second"[..]));
        assert!(!temp_path(&path).exists());
    }

    #[tokio::test]
    async fn read_missing_file() {
        let tempdir = tempfile::tempdir().unwrap();
        let contents = read_file_if_exists(&tempdir.path().join("missing"))
            .await
            .unwrap();
        assert!(contents.is_none());
    }

    #[tokio::test]
    async fn delete_matching_files() {
        let tempdir = tempfile::tempdir().unwrap();
        for name in ["a.tmp", "b.tmp", "keep"] {
            tokio::fs::write(tempdir.path().join(name), b"x")
                .await
                .unwrap();
        }

        let deleted =
            delete_files_warn_if_failed(tempdir.path(), |name| name.ends_with(".tmp")).await;
        assert!(deleted);

        assert!(!tempdir.path().join("a.tmp").exists());
        assert!(!tempdir.path().join("b.tmp").exists());
        assert!(tempdir.path().join("keep").exists());
    }

    #[tokio::test]
    async fn delete_missing_file_succeeds() {
        let tempdir = tempfile::tempdir().unwrap();
        assert!(delete_file_warn_if_failed(&tempdir.path().join("missing")).await);
    }
}
