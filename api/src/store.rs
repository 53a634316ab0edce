use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use tracing::{error, info, warn};
use vision_common::frame::FrameCache;

/// Capture-side collaborator the media server depends on.
pub trait PhotoStore: Send + Sync {
    /// Whether a capture can be requested right now.
    fn is_ready(&self) -> bool;

    /// Persist a new still into [`output_directory`](Self::output_directory)
    /// in the background. The result shows up in the directory listing.
    fn request_capture(&self);

    /// The single flat directory holding all photos.
    fn output_directory(&self) -> &Path;

    /// One-time setup, run before the server first accepts connections.
    fn prepare(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Photo store that snapshots the live frame cache into timestamped JPEG files.
pub struct DirectoryPhotoStore {
    output_dir: PathBuf,
    frames: Arc<FrameCache>,
}

impl DirectoryPhotoStore {
    pub fn new(output_dir: impl Into<PathBuf>, frames: Arc<FrameCache>) -> Self {
        Self {
            output_dir: output_dir.into(),
            frames,
        }
    }
}

/// `yyyy-MM-dd-HH-mm-ss-SSS` in local time.
pub fn capture_stem() -> String {
    Local::now().format("%Y-%m-%d-%H-%M-%S-%3f").to_string()
}

const MAX_NAME_ATTEMPTS: usize = 100;

/// Write `jpeg` as `<stem>.jpg`, or `<stem>-N.jpg` if that name is taken.
/// An existing photo is never replaced.
fn write_capture(dir: &Path, stem: &str, jpeg: &[u8]) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let name = match attempt {
            0 => format!("{stem}.jpg"),
            n => format!("{stem}-{n}.jpg"),
        };
        let path = dir.join(&name);
        // Listings only pick up `*.jpg`, so readers never see a half-written photo.
        let partial = dir.join(format!("{name}.part"));
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&partial) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        };
        let linked = file
            .write_all(jpeg)
            .and_then(|()| file.sync_all())
            .and_then(|()| fs::hard_link(&partial, &path));
        drop(file);
        let _ = fs::remove_file(&partial);
        match linked {
            Ok(()) => return Ok(path),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free capture filename for {stem}"),
    ))
}

impl PhotoStore for DirectoryPhotoStore {
    fn is_ready(&self) -> bool {
        self.frames.has_frame()
    }

    fn request_capture(&self) {
        let Some(jpeg) = self.frames.get() else {
            warn!("no frame available, capture skipped");
            return;
        };
        let dir = self.output_dir.clone();
        let stem = capture_stem();
        let save = move || match write_capture(&dir, &stem, &jpeg) {
            Ok(path) => info!(path = %path.display(), bytes = jpeg.len(), "photo saved"),
            Err(e) => error!(error = %e, dir = %dir.display(), "photo capture failed"),
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(save);
            }
            Err(_) => save(),
        }
    }

    fn output_directory(&self) -> &Path {
        &self.output_dir
    }

    fn prepare(&self) -> io::Result<()> {
        fs::create_dir_all(&self.output_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn capture_stem_shape() {
        let name = format!("{}.jpg", capture_stem());
        assert_eq!(name.len(), "2024-01-02-03-04-05-678.jpg".len());
        assert!(crate::gallery::is_valid_filename(&name));
    }

    #[test]
    fn same_millisecond_captures_are_both_kept() {
        let dir = TempDir::new().unwrap();
        let stem = "2024-01-02-03-04-05-678";

        let first = write_capture(dir.path(), stem, b"first").unwrap();
        let second = write_capture(dir.path(), stem, b"second").unwrap();
        let third = write_capture(dir.path(), stem, b"third").unwrap();

        assert_eq!(first, dir.path().join("2024-01-02-03-04-05-678.jpg"));
        assert_eq!(second, dir.path().join("2024-01-02-03-04-05-678-1.jpg"));
        assert_eq!(third, dir.path().join("2024-01-02-03-04-05-678-2.jpg"));
        assert_eq!(fs::read(&first).unwrap(), b"first");
        assert_eq!(fs::read(&second).unwrap(), b"second");
        assert!(crate::gallery::is_valid_filename("2024-01-02-03-04-05-678-1.jpg"));

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.path().extension().is_some_and(|x| x == "part"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn not_ready_without_frame() {
        let dir = TempDir::new().unwrap();
        let frames = Arc::new(FrameCache::new());
        let store = DirectoryPhotoStore::new(dir.path(), Arc::clone(&frames));
        assert!(!store.is_ready());
        frames.set(&[0xFF, 0xD8]);
        assert!(store.is_ready());
    }

    #[test]
    fn prepare_creates_directory() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("DCIM").join("photos");
        let store = DirectoryPhotoStore::new(&dir, Arc::new(FrameCache::new()));
        store.prepare().unwrap();
        assert!(dir.is_dir());
        assert_eq!(store.output_directory(), dir.as_path());
    }

    #[tokio::test]
    async fn capture_writes_current_frame() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("photos");
        let frames = Arc::new(FrameCache::new());
        frames.set(b"jpeg-bytes");
        let store = DirectoryPhotoStore::new(&dir, frames);

        store.request_capture();

        let mut saved = None;
        for _ in 0..50 {
            if let Some(photos) = crate::gallery::list_photos(&dir).unwrap() {
                if let Some(first) = photos.into_iter().next() {
                    saved = Some(first);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let saved = saved.expect("capture was not written");
        assert_eq!(fs::read(dir.join(saved.filename)).unwrap(), b"jpeg-bytes");
    }
}
