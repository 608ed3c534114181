//! Live line sources.
//!
//! [`FileFollower`] follows a file on disk the way `tail -F` does: it waits
//! for appended data, reopens the path after rotation and starts over after
//! truncation. [`ChannelSource`] feeds lines from memory.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::TailConfig;

#[derive(Error, Debug)]
pub enum FollowError {
    #[error("could not open file: {0}")]
    Open(#[source] std::io::Error),

    #[error("could not read file: {0}")]
    Read(#[source] std::io::Error),
}

/// A sequence of lines that ends either cleanly or with a terminal error.
#[async_trait]
pub trait LineSource: Send {
    /// The next line without its line terminator. `Ok(None)` means the
    /// source is closed and no more lines will follow.
    async fn next_line(&mut self) -> Result<Option<String>, FollowError>;
}

#[derive(Debug, Clone, Copy)]
pub struct TailOptions {
    pub poll_interval: Duration,
    pub from_beginning: bool,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self::from(&TailConfig::default())
    }
}

impl From<&TailConfig> for TailOptions {
    fn from(config: &TailConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            from_beginning: config.from_beginning,
        }
    }
}

pub struct FileFollower {
    path: PathBuf,
    reader: BufReader<File>,
    identity: Option<u64>,
    offset: u64,
    pending: Vec<u8>,
    poll_interval: Duration,
}

impl FileFollower {
    /// Opens `path` for following. Fails when the file cannot be opened now;
    /// later disappearance of the path is tolerated as rotation.
    pub async fn open(path: impl AsRef<Path>, options: TailOptions) -> Result<Self, FollowError> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path).await.map_err(FollowError::Open)?;
        let metadata = file.metadata().await.map_err(FollowError::Open)?;

        let offset = if options.from_beginning {
            0
        } else {
            file.seek(SeekFrom::End(0)).await.map_err(FollowError::Open)?
        };

        debug!(path = %path.display(), offset, "following file");

        Ok(Self {
            path,
            reader: BufReader::new(file),
            identity: file_identity(&metadata),
            offset,
            pending: Vec::new(),
            poll_interval: options.poll_interval,
        })
    }

    /// Called at end of file. Reopens the path when it now names a different
    /// file or when the file shrank below the read offset.
    async fn check_rotation(&mut self) -> Result<(), FollowError> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            // Rotated away and not yet recreated.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(FollowError::Read(e)),
        };

        let rotated = file_identity(&metadata) != self.identity;
        let truncated = metadata.len() < self.offset;
        if !rotated && !truncated {
            return Ok(());
        }

        let file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(FollowError::Read(e)),
        };
        info!(
            path = %self.path.display(),
            rotated,
            truncated,
            "log file replaced, reading from the start"
        );
        self.reader = BufReader::new(file);
        self.identity = file_identity(&metadata);
        self.offset = 0;
        self.pending.clear();
        Ok(())
    }
}

#[async_trait]
impl LineSource for FileFollower {
    async fn next_line(&mut self) -> Result<Option<String>, FollowError> {
        loop {
            let read = self
                .reader
                .read_until(b'\n', &mut self.pending)
                .await
                .map_err(FollowError::Read)?;
            self.offset += read as u64;

            if self.pending.last() == Some(&b'\n') {
                let mut line = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                line.pop();
                if line.ends_with('\r') {
                    line.pop();
                }
                return Ok(Some(line));
            }

            if read == 0 {
                self.check_rotation().await?;
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }
}

#[cfg(unix)]
fn file_identity(metadata: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.ino())
}

#[cfg(not(unix))]
fn file_identity(_metadata: &std::fs::Metadata) -> Option<u64> {
    None
}

/// Lines delivered through a channel. Closes when every sender is dropped.
pub struct ChannelSource {
    receiver: mpsc::Receiver<Result<String, FollowError>>,
}

impl ChannelSource {
    pub fn new(receiver: mpsc::Receiver<Result<String, FollowError>>) -> Self {
        Self { receiver }
    }

    /// A bounded channel and the source reading from it.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Result<String, FollowError>>, Self) {
        let (sender, receiver) = mpsc::channel(capacity);
        (sender, Self::new(receiver))
    }
}

#[async_trait]
impl LineSource for ChannelSource {
    async fn next_line(&mut self) -> Result<Option<String>, FollowError> {
        self.receiver.recv().await.transpose()
    }
}
