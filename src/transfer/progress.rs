//! Transfer progress counters shared between worker tasks and the terminal
//! renderer. Counters are atomics; the renderer only ever reads.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

const RENDER_INTERVAL: Duration = Duration::from_millis(100);

/// Byte counter for one file.
pub struct FileProgress {
    pub name: String,
    pub size: u64,
    transferred: AtomicU64,
}

impl FileProgress {
    pub fn add(&self, bytes: u64) {
        self.transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn set(&self, bytes: u64) {
        self.transferred.store(bytes, Ordering::Relaxed);
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }
}

/// Registry of per-file counters. Files can be registered as they become
/// known, which the receiver only learns mid-handshake.
#[derive(Default)]
pub struct Progress {
    files: Mutex<Vec<Arc<FileProgress>>>,
}

impl Progress {
    pub fn new() -> Arc<Progress> {
        Arc::new(Progress::default())
    }

    pub fn register(&self, name: &str, size: u64) -> Arc<FileProgress> {
        let file = Arc::new(FileProgress {
            name: name.to_string(),
            size,
            transferred: AtomicU64::new(0),
        });
        self.files.lock().unwrap().push(file.clone());
        file
    }

    /// (bytes transferred, bytes expected, files registered)
    pub fn totals(&self) -> (u64, u64, usize) {
        let files = self.files.lock().unwrap();
        let transferred = files.iter().map(|f| f.transferred()).sum();
        let expected = files.iter().map(|f| f.size).sum();
        (transferred, expected, files.len())
    }
}

/// Renders a single status line on stderr until stopped, then clears it so
/// the summary line prints on a clean row.
pub struct ProgressRenderer {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ProgressRenderer {
    pub fn spawn(progress: Arc<Progress>) -> ProgressRenderer {
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RENDER_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => render_line(&progress),
                    _ = stopped.changed() => break,
                }
            }
            clear_line();
        });
        ProgressRenderer { stop, handle }
    }

    /// Stop rendering and clear the status line.
    pub async fn finish(self) {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
    }
}

fn render_line(progress: &Progress) {
    let (transferred, expected, files) = progress.totals();
    if files == 0 {
        return;
    }
    let mut err = std::io::stderr();
    if expected > 0 {
        let percent = transferred as f64 / expected as f64 * 100.0;
        let _ = write!(
            err,
            "\r{} / {} ({percent:.1}%) across {files} file(s)",
            human_bytes(transferred),
            human_bytes(expected),
        );
    } else {
        let _ = write!(err, "\r{} across {files} file(s)", human_bytes(transferred));
    }
    let _ = err.flush();
}

fn clear_line() {
    let mut err = std::io::stderr();
    let _ = write!(err, "\r{:width$}\r", "", width = 72);
    let _ = err.flush();
}

pub fn human_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_aggregate_registered_files() {
        let progress = Progress::new();
        let a = progress.register("a.bin", 100);
        let b = progress.register("b.bin", 50);

        a.add(40);
        b.set(50);

        let (transferred, expected, files) = progress.totals();
        assert_eq!(transferred, 90);
        assert_eq!(expected, 150);
        assert_eq!(files, 2);
    }

    #[test]
    fn human_bytes_units() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.0 KiB");
        assert_eq!(human_bytes(5 * 1024 * 1024), "5.0 MiB");
    }
}
