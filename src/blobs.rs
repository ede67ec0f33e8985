use std::io;
use std::path::{Path, PathBuf};

use actix_web::web::{Bytes, BytesMut};
use futures::stream::{LocalBoxStream, Stream, StreamExt, TryStreamExt};
use log::{debug, warn};
use tokio::io::AsyncWriteExt;
use tokio_util::codec::{BytesCodec, FramedRead};
use uuid::Uuid;

const BLOB_EXTENSION: &str = "enc";

/// Encrypted objects on the local filesystem, one file per share.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

/// A blob that exists on disk but has not been claimed yet. Dropping it
/// removes the file, including when the owning future is dropped mid-upload.
/// [`PendingBlob::keep`] disarms it.
#[must_use]
pub struct PendingBlob {
    location: String,
    path: Option<PathBuf>,
}

impl PendingBlob {
    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn keep(mut self) -> String {
        self.path = None;
        std::mem::take(&mut self.location)
    }
}

impl Drop for PendingBlob {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("removed partial blob {:?}", path),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("could not remove partial blob {:?}: {}", path, e),
            }
        }
    }
}

impl BlobStore {
    /// Opens the store, creating the root directory if it does not exist.
    pub async fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(BlobStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, location: &str) -> io::Result<PathBuf> {
        let well_formed = !location.is_empty()
            && location
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
            && !location.starts_with('.');
        if !well_formed {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "malformed blob location",
            ));
        }
        Ok(self.root.join(location))
    }

    /// Streams `data` into a freshly named blob. The blob is returned only
    /// after the file has been flushed and synced, and stays pending until
    /// the caller keeps it. On any error the partial file is removed.
    pub async fn write<S, E>(&self, data: &mut S) -> Result<PendingBlob, E>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: From<io::Error>,
    {
        let location = format!("{}.{}", Uuid::new_v4(), BLOB_EXTENSION);
        let path = self.path_for(&location)?;

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        let pending = PendingBlob {
            location,
            path: Some(path),
        };

        while let Some(chunk) = data.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        debug!("wrote blob {}", pending.location);
        Ok(pending)
    }

    pub async fn exists(&self, location: &str) -> io::Result<bool> {
        let path = self.path_for(location)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn read(
        &self,
        location: &str,
    ) -> io::Result<LocalBoxStream<'static, io::Result<Bytes>>> {
        let path = self.path_for(location)?;
        let file = tokio::fs::File::open(&path).await?;
        Ok(FramedRead::new(file, BytesCodec::new())
            .map_ok(BytesMut::freeze)
            .boxed_local())
    }

    /// Best-effort removal. An absent blob counts as deleted; other failures
    /// are logged and swallowed.
    pub async fn delete(&self, location: &str) {
        let path = match self.path_for(location) {
            Ok(path) => path,
            Err(e) => {
                warn!("refusing to delete blob {:?}: {}", location, e);
                return;
            }
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!("deleted blob {}", location),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("could not delete blob {}: {}", location, e),
        }
    }
}
