use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::info;

use parley_types::models::blob_name;

use crate::error::{Result, StoreError};

/// On-disk content blobs for stored files.
///
/// Each file lives at `{dir}/{fileId}.{extension}` (or `{dir}/{fileId}` when
/// the extension is empty). Chunks are written at their stated offset.
pub struct ContentStore {
    dir: PathBuf,
}

impl ContentStore {
    pub async fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).await?;
        info!("Content store directory: {}", dir.display());
        Ok(Self { dir })
    }

    /// Path of the blob for a file. Rejects names that could leave `dir`.
    pub fn blob_path(&self, file_id: &str, extension: &str) -> Result<PathBuf> {
        let name = blob_name(file_id, extension);
        let bad = file_id.is_empty()
            || name.contains('/')
            || name.contains('\\')
            || name.contains("..")
            || name.contains('\0');
        if bad {
            return Err(StoreError::InvalidName(name));
        }
        Ok(self.dir.join(name))
    }

    /// Write one chunk at `offset`. A chunk at offset 0 starts the blob over.
    pub async fn write_chunk(
        &self,
        file_id: &str,
        extension: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<usize> {
        let path = self.blob_path(file_id, extension)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(offset == 0)
            .open(&path)
            .await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;

        Ok(data.len())
    }

    /// Open a blob for sequential reading.
    pub async fn open(&self, file_id: &str, extension: &str) -> Result<fs::File> {
        let path = self.blob_path(file_id, extension)?;
        Ok(fs::File::open(&path).await?)
    }

    /// Size of the blob on disk, or `None` if it does not exist.
    pub async fn file_size(&self, file_id: &str, extension: &str) -> Result<Option<u64>> {
        let path = self.blob_path(file_id, extension)?;
        match fs::metadata(&path).await {
            Ok(m) if m.is_file() => Ok(Some(m.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// SHA-256 of a stored blob, hex encoded.
    pub async fn digest(&self, file_id: &str, extension: &str) -> Result<String> {
        let mut file = self.open(file_id, extension).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }
}
