use std::path::PathBuf;

use anyhow::{Result, bail};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::PhotoError;
use crate::ports::{ImageFormat, PhotoStore, PhotoValidator};

pub const MIN_PHOTO_BYTES: usize = 1024;
pub const MAX_PHOTO_BYTES: usize = 10 * 1024 * 1024;

const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF];
const PNG_MAGIC: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

/// Size bounds plus a container-format check on the leading bytes.
/// Says nothing about what the image shows.
#[derive(Debug, Clone)]
pub struct MagicNumberValidator {
    pub min_bytes: usize,
    pub max_bytes: usize,
}

impl Default for MagicNumberValidator {
    fn default() -> Self {
        Self {
            min_bytes: MIN_PHOTO_BYTES,
            max_bytes: MAX_PHOTO_BYTES,
        }
    }
}

impl PhotoValidator for MagicNumberValidator {
    fn validate(&self, bytes: &[u8]) -> Result<ImageFormat, PhotoError> {
        let size = bytes.len();
        if size < self.min_bytes {
            return Err(PhotoError::TooSmall {
                size,
                min: self.min_bytes,
            });
        }
        if size > self.max_bytes {
            return Err(PhotoError::TooLarge {
                size,
                max: self.max_bytes,
            });
        }
        sniff(bytes).ok_or(PhotoError::UnsupportedFormat)
    }
}

fn sniff(bytes: &[u8]) -> Option<ImageFormat> {
    if bytes.starts_with(JPEG_MAGIC) {
        Some(ImageFormat::Jpeg)
    } else if bytes.starts_with(PNG_MAGIC) {
        Some(ImageFormat::Png)
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some(ImageFormat::Webp)
    } else {
        None
    }
}

/// Content-addressed photo storage: each photo lives at
/// `{dir}/{sha256 of its bytes}`, so resubmitting the same image is a no-op.
pub struct DiskPhotoStore {
    dir: PathBuf,
}

impl DiskPhotoStore {
    pub async fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).await?;
        info!("Photo storage directory: {}", dir.display());
        Ok(Self { dir })
    }

    fn path_for(&self, photo_ref: &str) -> Result<PathBuf> {
        if !is_photo_ref(photo_ref) {
            bail!("Malformed photo reference: {}", photo_ref);
        }
        Ok(self.dir.join(photo_ref))
    }
}

#[async_trait]
impl PhotoStore for DiskPhotoStore {
    async fn put(&self, bytes: &[u8]) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let photo_ref = hex::encode(hasher.finalize());

        let path = self.path_for(&photo_ref)?;
        if fs::try_exists(&path).await? {
            debug!("Photo {} already stored", photo_ref);
            return Ok(photo_ref);
        }

        // Write under a temporary name so a crash never leaves a truncated
        // file behind the final name. Unique per call, since identical
        // uploads may race here.
        let partial = self.dir.join(format!("{}.{}.part", photo_ref, Uuid::new_v4()));
        if let Err(e) = fs::write(&partial, bytes).await {
            let _ = fs::remove_file(&partial).await;
            return Err(e.into());
        }
        fs::rename(&partial, &path).await?;

        debug!("Stored photo {} ({} bytes)", photo_ref, bytes.len());
        Ok(photo_ref)
    }

    async fn get(&self, photo_ref: &str) -> Result<Vec<u8>> {
        let path = self.path_for(photo_ref)?;
        Ok(fs::read(&path).await?)
    }
}

/// 64 lowercase hex characters. Anything else could escape the directory.
fn is_photo_ref(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn padded(prefix: &[u8], len: usize) -> Vec<u8> {
        let mut bytes = prefix.to_vec();
        bytes.resize(len, 0);
        bytes
    }

    #[test]
    fn accepts_known_containers() {
        let v = MagicNumberValidator::default();
        assert_eq!(v.validate(&padded(JPEG_MAGIC, 2048)), Ok(ImageFormat::Jpeg));
        assert_eq!(v.validate(&padded(PNG_MAGIC, 2048)), Ok(ImageFormat::Png));

        let mut webp = padded(b"RIFF", 2048);
        webp[8..12].copy_from_slice(b"WEBP");
        assert_eq!(v.validate(&webp), Ok(ImageFormat::Webp));
    }

    #[test]
    fn refuses_bad_sizes_and_formats() {
        let v = MagicNumberValidator::default();
        assert_eq!(
            v.validate(&padded(JPEG_MAGIC, 100)),
            Err(PhotoError::TooSmall { size: 100, min: 1024 })
        );
        assert!(matches!(
            v.validate(&padded(JPEG_MAGIC, MAX_PHOTO_BYTES + 1)),
            Err(PhotoError::TooLarge { .. })
        ));
        assert_eq!(
            v.validate(&padded(b"GIF89a", 2048)),
            Err(PhotoError::UnsupportedFormat)
        );
        // RIFF without the WEBP tag is some other container.
        assert_eq!(
            v.validate(&padded(b"RIFF\0\0\0\0WAVE", 2048)),
            Err(PhotoError::UnsupportedFormat)
        );
    }

    #[tokio::test]
    async fn disk_store_is_content_addressed() {
        let dir = std::env::temp_dir().join(format!("handsign-photos-{}", Uuid::new_v4()));
        let store = DiskPhotoStore::new(dir.clone()).await.unwrap();

        let bytes = padded(JPEG_MAGIC, 4096);
        let first = store.put(&bytes).await.unwrap();
        let second = store.put(&bytes).await.unwrap();
        assert_eq!(first, second);
        assert!(is_photo_ref(&first));
        assert_eq!(store.get(&first).await.unwrap(), bytes);

        assert!(store.get("../../etc/passwd").await.is_err());
        assert!(store.get(&"0".repeat(64)).await.is_err());

        fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_identical_puts_both_succeed() {
        let dir = std::env::temp_dir().join(format!("handsign-photos-{}", Uuid::new_v4()));
        let store = DiskPhotoStore::new(dir.clone()).await.unwrap();
        let bytes = padded(PNG_MAGIC, 256 * 1024);

        let (a, b) = tokio::join!(store.put(&bytes), store.put(&bytes));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a, b);
        assert_eq!(store.get(&a).await.unwrap(), bytes);

        // Only the final file is left, no temporaries.
        let mut entries = fs::read_dir(&dir).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec![a]);

        fs::remove_dir_all(&dir).await.unwrap();
    }
}
