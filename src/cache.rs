//! Run-scoped intermediate storage.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/<run_id>/frames/0000000150.png   cropped frames, one per index
//! <root>/<run_id>/results.jsonl           recognized results, in frame order
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::Utc;
use image::{DynamicImage, ImageFormat};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{ExtractError, Result};
use crate::recognition::RecognitionResult;

static RUN_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Run identifier derived from the source path, unique per invocation.
pub fn run_id(source: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.to_string_lossy().as_bytes());
    hasher.update(
        Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_le_bytes(),
    );
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(RUN_SEQUENCE.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

#[derive(Debug, Clone)]
pub struct CacheManager {
    root: PathBuf,
}

impl CacheManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    /// Creates a fresh working area. The returned guard removes it on drop
    /// unless retention was requested.
    pub fn acquire(&self, run_id: &str) -> Result<RunCache> {
        let dir = self.run_dir(run_id);
        if dir.exists() {
            remove_dir(&dir)?;
        }
        let frames = dir.join("frames");
        fs::create_dir_all(&frames).map_err(|err| cache_error(&frames, err))?;
        debug!(path = %dir.display(), "Acquired run cache");
        Ok(RunCache {
            dir,
            frames,
            keep: AtomicBool::new(false),
            released: AtomicBool::new(false),
        })
    }

    /// Removes the working area of `run_id` unless `keep` is set. Calling it
    /// again, or for a run that no longer exists, is a no-op.
    pub fn release(&self, run_id: &str, keep: bool) -> Result<()> {
        if keep {
            debug!(run_id, "Keeping run cache");
            return Ok(());
        }
        remove_dir(&self.run_dir(run_id))
    }
}

/// Working area of one run.
#[derive(Debug)]
pub struct RunCache {
    dir: PathBuf,
    frames: PathBuf,
    keep: AtomicBool,
    released: AtomicBool,
}

impl RunCache {
    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn frame_store(&self) -> FrameStore {
        FrameStore {
            dir: self.frames.clone(),
        }
    }

    pub fn results_path(&self) -> PathBuf {
        self.dir.join("results.jsonl")
    }

    pub fn result_log(&self) -> Result<ResultLog> {
        let path = self.results_path();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| cache_error(&path, err))?;
        Ok(ResultLog {
            writer: BufWriter::new(file),
            path,
        })
    }

    pub fn set_keep(&self, keep: bool) {
        self.keep.store(keep, Ordering::Release);
    }

    pub fn keep(&self) -> bool {
        self.keep.load(Ordering::Acquire)
    }

    /// Removes the directory unless kept. Idempotent.
    pub fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.keep() {
            debug!(path = %self.dir.display(), "Keeping run cache");
            return Ok(());
        }
        remove_dir(&self.dir)
    }
}

impl Drop for RunCache {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(error = %err, "Failed to clean up run cache");
        }
    }
}

/// Append-only frame images keyed by frame index.
#[derive(Debug, Clone)]
pub struct FrameStore {
    dir: PathBuf,
}

impl FrameStore {
    pub fn path_for(&self, frame_index: u64) -> PathBuf {
        self.dir.join(format!("{frame_index:010}.png"))
    }

    /// Writes a frame. Fails if the key was already written.
    pub fn put(&self, frame_index: u64, image: &DynamicImage) -> Result<PathBuf> {
        let path = self.path_for(frame_index);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|err| cache_error(&path, err))?;
        let mut writer = BufWriter::new(file);
        image.write_to(&mut writer, ImageFormat::Png)?;
        writer.flush()?;
        Ok(path)
    }

    pub fn get(&self, frame_index: u64) -> Result<DynamicImage> {
        Ok(image::open(self.path_for(frame_index))?)
    }
}

/// Partial results, one JSON object per line.
#[derive(Debug)]
pub struct ResultLog {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl ResultLog {
    pub fn append(&mut self, result: &RecognitionResult) -> Result<()> {
        serde_json::to_writer(&mut self.writer, result)
            .map_err(|err| cache_error(&self.path, err))?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Reads back a results log written by [`ResultLog`].
pub fn read_results(path: &Path) -> Result<Vec<RecognitionResult>> {
    let content = fs::read_to_string(path).map_err(|err| cache_error(path, err))?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(|err| cache_error(path, err)))
        .collect()
}

fn remove_dir(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => {
            debug!(path = %dir.display(), "Removed run cache");
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(cache_error(dir, err)),
    }
}

fn cache_error(path: &Path, err: impl std::fmt::Display) -> ExtractError {
    ExtractError::Cache {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn tiny() -> DynamicImage {
        DynamicImage::ImageRgb8(ImageBuffer::from_pixel(4, 2, Rgb([200, 10, 10])))
    }

    #[test]
    fn release_is_idempotent_and_runs_on_drop() {
        let temp = tempfile::tempdir().unwrap();
        let manager = CacheManager::new(temp.path());

        let cache = manager.acquire("run-a").unwrap();
        let dir = cache.path().to_path_buf();
        assert!(dir.join("frames").is_dir());
        cache.release().unwrap();
        cache.release().unwrap();
        assert!(!dir.exists());
        manager.release("run-a", false).unwrap();

        {
            let _cache = manager.acquire("run-b").unwrap();
        }
        assert!(!manager.run_dir("run-b").exists());
    }

    #[test]
    fn kept_cache_survives() {
        let temp = tempfile::tempdir().unwrap();
        let manager = CacheManager::new(temp.path());
        let cache = manager.acquire("run-c").unwrap();
        cache.set_keep(true);
        drop(cache);
        assert!(manager.run_dir("run-c").is_dir());
        manager.release("run-c", true).unwrap();
        assert!(manager.run_dir("run-c").is_dir());
        manager.release("run-c", false).unwrap();
        assert!(!manager.run_dir("run-c").exists());
    }

    #[test]
    fn frame_keys_are_written_once() {
        let temp = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(temp.path()).acquire("run-d").unwrap();
        let store = cache.frame_store();
        let path = store.put(42, &tiny()).unwrap();
        assert!(path.ends_with("0000000042.png"));
        assert!(store.put(42, &tiny()).is_err());
        assert_eq!(store.get(42).unwrap().width(), 4);
        let stored = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(stored, 1);
    }

    #[test]
    fn results_log_round_trips() {
        let temp = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(temp.path()).acquire("run-e").unwrap();
        let mut log = cache.result_log().unwrap();
        log.append(&RecognitionResult::new(3, "你好", 0.91)).unwrap();
        log.append(&RecognitionResult::empty(4)).unwrap();
        log.flush().unwrap();
        let results = read_results(&cache.results_path()).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].text, "你好");
        assert_eq!(results[1].frame_index, 4);
    }

    #[test]
    fn run_ids_differ_per_invocation() {
        let a = run_id(Path::new("/videos/a.mp4"));
        let b = run_id(Path::new("/videos/a.mp4"));
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }
}
