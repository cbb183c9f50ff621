//! Filesystem blob store with a crop cache.
//!
//! Source images live under a blob root (`Blob::location` is relative to it).
//! Materialized patches are PNG-encoded and cached under
//! `{cache_dir}/{blob_id}/{x}_{y}_{w}_{h}_{flip}_{rot}.png`, so repeated
//! materialization of one patch decodes the source image only once.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use kaizen_core::{Blob, BlobStore, Error, Patch, PatchKey, Result};

/// Blob store reading source images from disk.
#[derive(Debug, Clone)]
pub struct FilesystemBlobStore {
    blob_dir: PathBuf,
    cache_dir: PathBuf,
}

impl FilesystemBlobStore {
    /// Create a store reading from `blob_dir` and caching crops in `cache_dir`.
    pub fn new(blob_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            blob_dir: blob_dir.into(),
            cache_dir: cache_dir.into(),
        }
    }

    fn source_path(&self, blob: &Blob) -> PathBuf {
        self.blob_dir.join(&blob.location)
    }

    /// Cache path of a crop: keyed by blob id and full crop geometry.
    pub fn cache_path(&self, key: &PatchKey) -> PathBuf {
        self.cache_dir.join(key.blob_id.to_string()).join(format!(
            "{}_{}_{}_{}_{}_{}.png",
            key.x,
            key.y,
            key.width,
            key.height,
            u8::from(key.fliplr),
            key.rotation
        ))
    }

    async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                warn!(parent = %parent.display(), error = %e, "blob_store: create_dir_all failed");
                e
            })?;
        }

        // Atomic write: temp file + rename
        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, path).await.map_err(|e| {
            warn!(from = %temp_path.display(), to = %path.display(), error = %e, "blob_store: rename failed");
            e
        })?;
        Ok(())
    }
}

/// Crop, mirror and rotate an image according to a patch key.
///
/// The crop rectangle must lie inside the image.
pub fn render_patch(image: &DynamicImage, key: &PatchKey) -> Result<DynamicImage> {
    if key.x < 0 || key.y < 0 || key.width <= 0 || key.height <= 0 {
        return Err(Error::InvalidInput(format!("invalid crop geometry: {:?}", key)));
    }
    let (x, y, w, h) = (key.x as u32, key.y as u32, key.width as u32, key.height as u32);
    if x + w > image.width() || y + h > image.height() {
        return Err(Error::InvalidInput(format!(
            "crop {}x{}+{}+{} exceeds {}x{} image",
            w,
            h,
            x,
            y,
            image.width(),
            image.height()
        )));
    }

    let mut out = image.crop_imm(x, y, w, h);
    if key.fliplr {
        out = out.fliph();
    }
    out = match key.rotation.rem_euclid(360) {
        0 => out,
        90 => out.rotate90(),
        180 => out.rotate180(),
        270 => out.rotate270(),
        other => {
            return Err(Error::InvalidInput(format!(
                "rotation must be a multiple of 90, got {}",
                other
            )))
        }
    };
    Ok(out)
}

/// PNG-encode an image.
pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, ImageFormat::Png)?;
    Ok(buf.into_inner())
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn materialize(&self, blob: &Blob, patch: &Patch) -> Result<Vec<u8>> {
        let cached = self.cache_path(&patch.key);
        if fs::try_exists(&cached).await? {
            return Ok(fs::read(&cached).await?);
        }

        let source = self.source_path(blob);
        let bytes = fs::read(&source).await.map_err(|e| {
            warn!(
                subsystem = "blob_store",
                blob_id = blob.id,
                path = %source.display(),
                error = %e,
                "Source image unreadable"
            );
            e
        })?;

        let key = patch.key;
        let encoded = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let image = image::load_from_memory(&bytes)?;
            encode_png(&render_patch(&image, &key)?)
        })
        .await
        .map_err(|e| Error::Internal(format!("crop task panicked: {}", e)))??;

        Self::write_atomic(&cached, &encoded).await?;
        debug!(
            subsystem = "blob_store",
            op = "materialize",
            blob_id = blob.id,
            patch_id = patch.id,
            size = encoded.len(),
            "Patch materialized"
        );
        Ok(encoded)
    }

    async fn dimensions(&self, blob: &Blob) -> Result<(u32, u32)> {
        let source = self.source_path(blob);
        tokio::task::spawn_blocking(move || image::image_dimensions(&source))
            .await
            .map_err(|e| Error::Internal(format!("dimension read panicked: {}", e)))?
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn gradient(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |x, y| Rgb([x as u8, y as u8, 0])))
    }

    fn blob() -> Blob {
        Blob {
            id: 7,
            dataset_id: 1,
            location: "img.png".into(),
        }
    }

    #[test]
    fn test_render_patch_crop_and_flip() {
        let img = gradient(10, 10);
        let key = PatchKey::new(1, 2, 3, 4, 5);
        let out = render_patch(&img, &key).unwrap().to_rgb8();
        assert_eq!(out.dimensions(), (4, 5));
        assert_eq!(out.get_pixel(0, 0), &Rgb([2, 3, 0]));

        let flipped = render_patch(&img, &key.mirrored()).unwrap().to_rgb8();
        assert_eq!(flipped.get_pixel(0, 0), &Rgb([5, 3, 0]));
    }

    #[test]
    fn test_render_patch_rotation_swaps_dimensions() {
        let img = gradient(10, 10);
        let key = PatchKey {
            rotation: 90,
            ..PatchKey::new(1, 0, 0, 4, 2)
        };
        let out = render_patch(&img, &key).unwrap();
        assert_eq!((out.width(), out.height()), (2, 4));
    }

    #[test]
    fn test_render_patch_rejects_out_of_bounds() {
        let img = gradient(10, 10);
        let err = render_patch(&img, &PatchKey::new(1, 8, 8, 4, 4)).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let bad_rotation = PatchKey {
            rotation: 45,
            ..PatchKey::new(1, 0, 0, 2, 2)
        };
        assert!(render_patch(&img, &bad_rotation).is_err());
    }

    #[test]
    fn test_cache_path_distinguishes_geometry() {
        let store = FilesystemBlobStore::new("/blobs", "/cache");
        let key = PatchKey::new(7, 1, 2, 3, 4);
        assert_eq!(
            store.cache_path(&key),
            PathBuf::from("/cache/7/1_2_3_4_0_0.png")
        );
        assert_ne!(store.cache_path(&key), store.cache_path(&key.mirrored()));
    }

    #[tokio::test]
    async fn test_materialize_writes_cache() {
        let blobs = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        gradient(16, 16).save(blobs.path().join("img.png")).unwrap();

        let store = FilesystemBlobStore::new(blobs.path(), cache.path());
        let patch = Patch {
            id: 1,
            key: PatchKey::new(7, 0, 0, 8, 8),
        };
        let bytes = store.materialize(&blob(), &patch).await.unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 8));
        assert!(store.cache_path(&patch.key).exists());

        // Cache hit survives removal of the source.
        std::fs::remove_file(blobs.path().join("img.png")).unwrap();
        let again = store.materialize(&blob(), &patch).await.unwrap();
        assert_eq!(again, bytes);
    }

    #[tokio::test]
    async fn test_dimensions_reads_header() {
        let blobs = tempfile::tempdir().unwrap();
        gradient(12, 5).save(blobs.path().join("img.png")).unwrap();
        let store = FilesystemBlobStore::new(blobs.path(), blobs.path().join("cache"));
        assert_eq!(store.dimensions(&blob()).await.unwrap(), (12, 5));
    }

    #[tokio::test]
    async fn test_materialize_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::new(dir.path(), dir.path().join("cache"));
        let patch = Patch {
            id: 1,
            key: PatchKey::new(7, 0, 0, 1, 1),
        };
        let err = store.materialize(&blob(), &patch).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
