//! Command output sinks.
//!
//! An [`OutputSink`] fans every write out to a capture file and to any live
//! subscribers. A subscriber that goes away is dropped without affecting the
//! file, and a failing file does not stop the live feed.

use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

enum Target {
    File(File),
    Live(mpsc::UnboundedSender<Bytes>),
}

#[derive(Clone, Default)]
pub struct OutputSink {
    targets: Arc<Mutex<Vec<Target>>>,
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSink")
            .field("targets", &self.targets.lock().len())
            .finish()
    }
}

impl OutputSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink capturing to a newly created file.
    pub fn to_file(path: &Path) -> std::io::Result<Self> {
        let sink = Self::new();
        sink.attach_file(path)?;
        Ok(sink)
    }

    pub fn attach_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        self.targets.lock().push(Target::File(file));
        Ok(())
    }

    pub fn attach_live(&self, sender: mpsc::UnboundedSender<Bytes>) {
        self.targets.lock().push(Target::Live(sender));
    }

    /// Subscribe to everything written from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.attach_live(tx);
        rx
    }

    pub fn has_live(&self) -> bool {
        self.targets
            .lock()
            .iter()
            .any(|t| matches!(t, Target::Live(tx) if !tx.is_closed()))
    }

    /// Write to every target. Returns the first file error, after all
    /// targets have been tried.
    pub fn write(&self, data: &[u8]) -> std::io::Result<()> {
        let bytes = Bytes::copy_from_slice(data);
        let mut first_error = None;
        let mut targets = self.targets.lock();
        targets.retain_mut(|target| match target {
            Target::File(file) => {
                if let Err(e) = file.write_all(data) {
                    first_error.get_or_insert(e);
                }
                true
            }
            Target::Live(tx) => tx.send(bytes.clone()).is_ok(),
        });
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.write(&data)
    }

    pub fn flush(&self) -> std::io::Result<()> {
        for target in self.targets.lock().iter_mut() {
            if let Target::File(file) = target {
                file.flush()?;
            }
        }
        Ok(())
    }

    /// A new sink that captures to `path` and shares this sink's live
    /// subscribers.
    pub fn fork(&self, path: &Path) -> std::io::Result<Self> {
        let forked = Self::to_file(path)?;
        for target in self.targets.lock().iter() {
            if let Target::Live(tx) = target {
                forked.attach_live(tx.clone());
            }
        }
        Ok(forked)
    }
}
