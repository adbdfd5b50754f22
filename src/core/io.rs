use crate::core::models::short_id;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Standard layout for project files in the blob store.
pub fn project_path(pid: &str, folder: &str, filename: &str) -> String {
    format!("projects/{}/{}/{}", pid, folder, filename)
}

pub fn project_prefix(pid: &str) -> String {
    format!("projects/{}/", pid)
}

/// Object storage for uploads and generated artifacts. Paths are
/// slash-separated keys relative to the store root.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;
    async fn delete(&self, path: &str) -> Result<()>;
    async fn exists(&self, path: &str) -> Result<bool>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Removes every object under `prefix`, returning how many went away.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let keys = self.list(prefix).await?;
        for key in &keys {
            self.delete(key).await?;
        }
        Ok(keys.len())
    }

    async fn upload_file(&self, local: &Path, path: &str) -> Result<String> {
        let content = tokio::fs::read(local)
            .await
            .with_context(|| format!("Failed to read {}", local.display()))?;
        self.write(path, &content).await?;
        log::info!("Uploaded {} to {}", local.display(), path);
        Ok(path.to_string())
    }

    /// Fetches `path` into `local`, retrying with exponential backoff plus
    /// jitter (1s, 2s, 4s, ... + up to 1s).
    async fn download(&self, path: &str, local: &Path, attempts: usize) -> Result<PathBuf> {
        let attempts = attempts.max(1);
        let mut attempt = 0;
        loop {
            let result = async {
                let data = self.read(path).await?;
                if let Some(parent) = local.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(local, data).await?;
                Ok::<_, anyhow::Error>(())
            }
            .await;

            match result {
                Ok(()) => return Ok(local.to_path_buf()),
                Err(e) if attempt + 1 >= attempts => {
                    log::error!("Failed to download {} after {} attempts: {}", path, attempts, e);
                    return Err(e);
                }
                Err(e) => {
                    let wait = Duration::from_secs(1 << attempt)
                        + Duration::from_secs_f64(rand::random::<f64>());
                    log::warn!(
                        "Download failed for {} (attempt {}/{}). Retrying in {:.2?}... Error: {}",
                        path,
                        attempt + 1,
                        attempts,
                        wait,
                        e
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Read-only URL valid for `ttl`.
    async fn sign(&self, path: &str, ttl: Duration) -> Result<String>;
}

const PARTIAL_SUFFIX: &str = ".partial";

fn is_partial(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().ends_with(PARTIAL_SUFFIX))
        .unwrap_or(false)
}

pub struct NativeStorage {
    root: PathBuf,
}

impl NativeStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(anyhow!("Refusing path outside storage root: {}", path));
        }
        Ok(self.root.join(relative))
    }

    fn collect(&self, dir: &Path, out: &mut Vec<String>) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                self.collect(&path, out)?;
            } else if is_partial(&path) {
                continue;
            } else if let Ok(rel) = path.strip_prefix(&self.root) {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for NativeStorage {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path)?;
        tokio::fs::read(&full)
            .await
            .with_context(|| format!("Failed to read {}", path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        // Readers see either the old object or the new one, never a torn write.
        let name = full
            .file_name()
            .ok_or_else(|| anyhow!("Invalid object path: {}", path))?
            .to_string_lossy()
            .to_string();
        let partial = full.with_file_name(format!(".{}.{}{}", name, short_id(), PARTIAL_SUFFIX));
        if let Err(e) = tokio::fs::write(&partial, content).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e).with_context(|| format!("Failed to write {}", path));
        }
        tokio::fs::rename(&partial, &full)
            .await
            .with_context(|| format!("Failed to replace {}", path))?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        if tokio::fs::try_exists(&full).await? {
            if full.is_dir() {
                tokio::fs::remove_dir_all(&full).await?;
            } else {
                tokio::fs::remove_file(&full).await?;
            }
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.resolve(path)?).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut entries = Vec::new();
        if self.root.exists() {
            self.collect(&self.root, &mut entries)?;
        }
        entries.retain(|e| e.starts_with(prefix));
        entries.sort();
        Ok(entries)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let keys = self.list(prefix).await?;
        for key in &keys {
            self.delete(key).await?;
        }
        if !keys.is_empty() {
            log::info!("Deleted {} files from folder: {}", keys.len(), prefix);
        }
        Ok(keys.len())
    }

    async fn sign(&self, path: &str, ttl: Duration) -> Result<String> {
        let full = self.resolve(path)?;
        let absolute = if full.is_absolute() {
            full
        } else {
            std::env::current_dir()?.join(full)
        };
        let mut url = url::Url::from_file_path(&absolute)
            .map_err(|_| anyhow!("Cannot build URL for {}", absolute.display()))?;
        let expires = chrono::Utc::now() + chrono::Duration::from_std(ttl)?;
        url.query_pairs_mut()
            .append_pair("expires", &expires.timestamp().to_string());
        Ok(url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_list_delete_prefix() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = NativeStorage::new(dir.path());

        storage.write(&project_path("p1", "assets", "a.png"), b"a").await?;
        storage.write(&project_path("p1", "audio", "b.mp3"), b"b").await?;
        storage.write(&project_path("p2", "assets", "c.png"), b"c").await?;

        assert_eq!(storage.read("projects/p1/assets/a.png").await?, b"a");
        let listed = storage.list(&project_prefix("p1")).await?;
        assert_eq!(
            listed,
            vec!["projects/p1/assets/a.png".to_string(), "projects/p1/audio/b.mp3".to_string()]
        );

        assert_eq!(storage.delete_prefix(&project_prefix("p1")).await?, 2);
        assert!(!storage.exists("projects/p1/assets/a.png").await?);
        assert!(storage.exists("projects/p2/assets/c.png").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_overwrite_replaces_whole_object() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = NativeStorage::new(dir.path());
        storage.write("p1.json", br#"{"status": "running", "logs": ["a", "b"]}"#).await?;
        storage.write("p1.json", br#"{"status": "idle"}"#).await?;

        assert_eq!(storage.read("p1.json").await?, br#"{"status": "idle"}"#);
        let names: Vec<_> = std::fs::read_dir(dir.path())?
            .map(|e| e.map(|e| e.file_name().to_string_lossy().to_string()))
            .collect::<std::io::Result<_>>()?;
        assert_eq!(names, vec!["p1.json"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_skips_unfinished_writes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = NativeStorage::new(dir.path());
        storage.write("p1.json", b"{}").await?;
        std::fs::write(dir.path().join(".p2.json.0badc0de.partial"), b"{\"sta")?;
        assert_eq!(storage.list("").await?, vec!["p1.json".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_parent_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let storage = NativeStorage::new(dir.path());
        assert!(storage.read("../etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_download_and_sign() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = NativeStorage::new(dir.path().join("store"));
        storage.write("projects/p/output/final.mp4", b"video").await?;

        let local = dir.path().join("tmp").join("final.mp4");
        let got = storage.download("projects/p/output/final.mp4", &local, 3).await?;
        assert_eq!(std::fs::read(got)?, b"video");

        let url = storage
            .sign("projects/p/output/final.mp4", Duration::from_secs(3600))
            .await?;
        assert!(url.starts_with("file://"));
        assert!(url.contains("expires="));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_missing_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let storage = NativeStorage::new(dir.path());
        let result = storage
            .download("projects/p/missing.png", &dir.path().join("x.png"), 2)
            .await;
        assert!(result.is_err());
    }
}
