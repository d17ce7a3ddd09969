//! Async save-RAM flusher: one worker thread per loaded cartridge,
//! debouncing writes and persisting to disk atomically.
//!
//! Grounded directly on melonDS's `NDSCart_SRAMManager`: a version counter
//! bumped on every `request_flush`, a secondary buffer snapshotted under a
//! mutex, and a worker that wakes periodically, checks the version, and
//! only then does the (slow) file write. The debounce window here is
//! driven by a condition variable with a timeout instead of a raw sleep
//! loop, so a shutdown request wakes the worker immediately instead of
//! waiting out the last poll interval.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const DEBOUNCE: Duration = Duration::from_millis(500);

struct Shared {
    path: PathBuf,
    secondary: Mutex<Vec<u8>>,
    flush_version: AtomicU64,
    written_version: AtomicU64,
    last_request: Mutex<Option<Instant>>,
    running: AtomicBool,
    wake: Condvar,
    wake_lock: Mutex<()>,
}

pub struct Flusher {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Flusher {
    pub fn spawn(path: PathBuf, initial: Vec<u8>) -> Self {
        let shared = Arc::new(Shared {
            path,
            secondary: Mutex::new(initial),
            flush_version: AtomicU64::new(0),
            written_version: AtomicU64::new(0),
            last_request: Mutex::new(None),
            running: AtomicBool::new(true),
            wake: Condvar::new(),
            wake_lock: Mutex::new(()),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::spawn(move || Self::run(worker_shared));
        Flusher {
            shared,
            worker: Some(worker),
        }
    }

    /// Called from the emulator thread on every save-RAM write. Snapshots
    /// `primary` into the secondary buffer under the mutex and bumps the
    /// version; the actual file write happens later, off-thread.
    pub fn request_flush(&self, primary: &[u8]) {
        {
            let mut secondary = self.shared.secondary.lock().unwrap();
            secondary.clear();
            secondary.extend_from_slice(primary);
        }
        self.shared.flush_version.fetch_add(1, Ordering::SeqCst);
        *self.shared.last_request.lock().unwrap() = Some(Instant::now());
        self.shared.wake.notify_one();
    }

    fn run(shared: Arc<Shared>) {
        let mut guard = shared.wake_lock.lock().unwrap();
        loop {
            let (next_guard, _) = shared.wake.wait_timeout(guard, DEBOUNCE).unwrap();
            guard = next_guard;
            if !shared.running.load(Ordering::SeqCst) {
                break;
            }
            Self::maybe_flush(&shared, false);
        }
        // Final flush on shutdown bypasses the debounce window: any
        // pending write must reach disk before the worker is joined.
        Self::maybe_flush(&shared, true);
    }

    fn maybe_flush(shared: &Arc<Shared>, force: bool) {
        let flush_version = shared.flush_version.load(Ordering::SeqCst);
        if flush_version == shared.written_version.load(Ordering::SeqCst) {
            return;
        }
        if !force {
            let debounced = shared
                .last_request
                .lock()
                .unwrap()
                .map_or(true, |t| t.elapsed() >= DEBOUNCE);
            if !debounced {
                return;
            }
        }
        let snapshot = shared.secondary.lock().unwrap().clone();
        if write_atomically(&shared.path, &snapshot).is_ok() {
            shared.written_version.store(flush_version, Ordering::SeqCst);
        }
    }
}

impl Drop for Flusher {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.wake.notify_one();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn write_atomically(path: &std::path::Path, data: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, data)?;
    std::fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_then_drop_persists_final_contents() {
        let dir = std::env::temp_dir().join(format!("nitrocore-save-test-{:?}", std::thread::current().id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("test.sav");
        let flusher = Flusher::spawn(path.clone(), vec![0; 4]);
        flusher.request_flush(&[1, 2, 3, 4]);
        drop(flusher);
        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(on_disk, vec![1, 2, 3, 4]);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
