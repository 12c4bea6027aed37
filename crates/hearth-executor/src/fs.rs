//! Directory helpers shared by bootstrapping, artifact capture and
//! result collection.

use std::path::{Path, PathBuf};

/// Recursively copy `src` into `dst`, creating `dst` as needed. Returns the
/// copied files relative to `src`.
#[async_recursion::async_recursion]
pub async fn copy_dir(src: &Path, dst: &Path) -> std::io::Result<Vec<PathBuf>> {
    tokio::fs::create_dir_all(dst).await?;
    let mut copied = Vec::new();
    let mut entries = tokio::fs::read_dir(src).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type().await?;

        if file_type.is_dir() {
            let nested = copy_dir(&path, &target).await?;
            copied.extend(nested.into_iter().map(|p| Path::new(&entry.file_name()).join(p)));
        } else if file_type.is_file() {
            tokio::fs::copy(&path, &target).await?;
            copied.push(PathBuf::from(entry.file_name()));
        }
    }

    copied.sort();
    Ok(copied)
}

/// Files under `dir`, relative to it and sorted.
pub async fn list_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    list_into(dir, Path::new(""), &mut files).await?;
    files.sort();
    Ok(files)
}

#[async_recursion::async_recursion]
async fn list_into(root: &Path, relative: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
    let mut entries = tokio::fs::read_dir(root.join(relative)).await?;
    while let Some(entry) = entries.next_entry().await? {
        let rel = relative.join(entry.file_name());
        let file_type = entry.file_type().await?;
        if file_type.is_dir() {
            list_into(root, &rel, files).await?;
        } else if file_type.is_file() {
            files.push(rel);
        }
    }
    Ok(())
}

/// Move a directory, falling back to copy and delete across filesystems.
pub async fn move_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    remove_dir_if_exists(dst).await?;
    if tokio::fs::rename(src, dst).await.is_ok() {
        return Ok(());
    }
    copy_dir(src, dst).await?;
    tokio::fs::remove_dir_all(src).await
}

pub async fn remove_dir_if_exists(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// `/` separated form of a relative path, as stored in results.
pub fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write(path: &Path, content: &str) {
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(path, content).await.unwrap();
    }

    #[tokio::test]
    async fn test_copy_dir() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        write(&src.join("a.txt"), "a").await;
        write(&src.join("nested/b.txt"), "b").await;

        let copied = copy_dir(&src, &dir.path().join("dst")).await.unwrap();

        assert_eq!(
            copied,
            vec![PathBuf::from("a.txt"), PathBuf::from("nested/b.txt")]
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("dst/nested/b.txt")).unwrap(),
            "b"
        );
    }

    #[tokio::test]
    async fn test_list_files() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("z.txt"), "").await;
        write(&dir.path().join("a/b/c.txt"), "").await;

        let files = list_files(dir.path()).await.unwrap();
        assert_eq!(
            files.iter().map(|p| to_slash(p)).collect::<Vec<_>>(),
            vec!["a/b/c.txt", "z.txt"]
        );
    }

    #[tokio::test]
    async fn test_move_dir_replaces_destination() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("out/dst");
        write(&src.join("new.txt"), "new").await;
        write(&dst.join("old.txt"), "old").await;

        move_dir(&src, &dst).await.unwrap();

        assert!(!src.exists());
        assert!(dst.join("new.txt").exists());
        assert!(!dst.join("old.txt").exists());
    }

    #[tokio::test]
    async fn test_remove_missing_dir_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        remove_dir_if_exists(&dir.path().join("missing"))
            .await
            .unwrap();
    }
}
