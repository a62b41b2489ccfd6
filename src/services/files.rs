use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates an empty file for an upload of `filename` under the owner's
    /// directory. The stored name is prefixed so repeated uploads of the
    /// same file never collide.
    pub async fn create_upload(&self, owner: &str, filename: &str) -> io::Result<(PathBuf, BufWriter<File>)> {
        let dir = self.root.join(sanitize(owner));
        fs::create_dir_all(&dir).await.map_err(|e| {
            tracing::error!("Failed to create upload directory {}: {}", dir.display(), e);
            e
        })?;

        let unique = uuid::Uuid::new_v4().simple().to_string();
        let stored_name = format!("{}_{}_{}", Utc::now().timestamp(), &unique[..8], sanitize(filename));
        let path = dir.join(stored_name);

        let file = File::create(&path).await.map_err(|e| {
            tracing::error!("Failed to create upload file {}: {}", path.display(), e);
            e
        })?;
        tracing::debug!("Created upload file: {}", path.display());
        Ok((path, BufWriter::new(file)))
    }

    pub async fn store_upload(&self, owner: &str, filename: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        let (path, mut writer) = self.create_upload(owner, filename).await?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(path)
    }

    /// Removes a stored upload. A file that is already gone is not an error.
    pub async fn discard(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        match fs::remove_file(path).await {
            Ok(()) => tracing::debug!("Discarded upload {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to discard upload {}: {}", path.display(), e),
        }
    }
}

/// Keeps only the final path component and replaces anything outside a
/// conservative character set.
fn sanitize(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("upload");
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}
