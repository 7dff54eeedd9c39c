//! Source reader for the watched log file or device.
//!
//! The reader opens one byte stream per broadcast session and hands out
//! whatever bytes became available since the last call. Two kinds of
//! source are supported:
//!
//! - Character devices and pipes (e.g. `/dev/klog`): opened non-blocking
//!   and driven by reactor readiness through [`AsyncFd`]. No read is ever
//!   left running in the background, so dropping the reader closes the
//!   descriptor immediately. End-of-stream is an error.
//! - Regular files: the reader starts at the current end of the file and
//!   follows it like `tail -f`. End-of-file just means "nothing yet"; the
//!   reader re-polls every `poll_interval` and fails once the file is
//!   truncated, removed or replaced, so the supervisor can reopen it.
//!
//! `read_chunk` is safe to use as a `tokio::select!` branch: dropping the
//! future never loses bytes. Device reads only happen after readiness is
//! reported, and `tokio::fs::File` hands the result of an interrupted
//! regular-file read to the next call.

use std::fs::OpenOptions;
use std::io::{self, Read, SeekFrom};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::sleep;
use tracing::debug;

/// Largest chunk read from the source in one go.
pub const READ_CHUNK_SIZE: usize = 4096;

/// Position and identity of a followed regular file.
#[derive(Debug, Clone, Copy)]
struct FollowState {
    position: u64,
    dev: u64,
    ino: u64,
}

/// The open handle, by kind of source.
#[derive(Debug)]
enum SourceHandle {
    /// Regular file followed from its end
    Follow { file: File, state: FollowState },
    /// Device or pipe read on readiness
    Stream(AsyncFd<std::fs::File>),
}

/// Reader over the watched source.
///
/// Owned by exactly one broadcast session; dropping it closes the handle.
#[derive(Debug)]
pub struct SourceReader {
    path: PathBuf,
    handle: SourceHandle,
    poll_interval: Duration,
}

impl SourceReader {
    /// Opens the source read-only.
    ///
    /// Regular files are positioned at their end so clients never see
    /// bytes written before the session started.
    pub async fn open(
        path: impl Into<PathBuf>,
        poll_interval: Duration,
    ) -> Result<Self, SourceError> {
        let path = path.into();

        // O_NONBLOCK keeps opening a FIFO without a writer from blocking;
        // regular files ignore it.
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
            .map_err(|e| SourceError::open(&path, e))?;
        let metadata = file.metadata().map_err(|e| SourceError::open(&path, e))?;

        if metadata.is_dir() {
            return Err(SourceError::open(
                &path,
                io::Error::other("source is a directory"),
            ));
        }

        let handle = if metadata.file_type().is_file() {
            let mut file = File::from_std(file);
            let position = file
                .seek(SeekFrom::End(0))
                .await
                .map_err(|e| SourceError::open(&path, e))?;
            SourceHandle::Follow {
                file,
                state: FollowState {
                    position,
                    dev: metadata.dev(),
                    ino: metadata.ino(),
                },
            }
        } else {
            SourceHandle::Stream(AsyncFd::new(file).map_err(|e| SourceError::open(&path, e))?)
        };

        let reader = Self {
            path,
            handle,
            poll_interval,
        };
        debug!(
            path = %reader.path.display(),
            follow = reader.is_following(),
            "Opened source"
        );
        Ok(reader)
    }

    /// Checks that the source can currently be opened, then closes it again.
    pub async fn probe(path: &Path) -> Result<(), SourceError> {
        Self::open(path, Duration::ZERO).await.map(drop)
    }

    /// Returns the path this reader was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if the source is a regular file being followed.
    pub fn is_following(&self) -> bool {
        matches!(self.handle, SourceHandle::Follow { .. })
    }

    /// Waits for the next bytes from the source and copies them into `buf`.
    ///
    /// Returns the number of bytes read, which is at least one unless `buf`
    /// is empty.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, SourceError> {
        if buf.is_empty() {
            return Ok(0);
        }

        match &mut self.handle {
            SourceHandle::Follow { file, state } => {
                follow_chunk(&self.path, file, state, self.poll_interval, buf).await
            }
            SourceHandle::Stream(fd) => stream_chunk(&self.path, fd, buf).await,
        }
    }
}

/// Reads from a device or pipe once the reactor reports it readable.
async fn stream_chunk(
    path: &Path,
    fd: &AsyncFd<std::fs::File>,
    buf: &mut [u8],
) -> Result<usize, SourceError> {
    let read_error = |e: io::Error| SourceError::Read {
        path: path.to_path_buf(),
        source: e,
    };

    loop {
        let mut guard = fd.readable().await.map_err(read_error)?;

        match guard.try_io(|inner| {
            let mut file: &std::fs::File = inner.get_ref();
            file.read(&mut *buf)
        }) {
            Ok(Ok(0)) => {
                return Err(SourceError::EndOfStream {
                    path: path.to_path_buf(),
                })
            }
            Ok(Ok(n)) => return Ok(n),
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
            Ok(Err(e)) => return Err(read_error(e)),
            // Spurious readiness; wait for the next event.
            Err(_would_block) => continue,
        }
    }
}

/// Reads from a followed regular file, waiting at end-of-file.
async fn follow_chunk(
    path: &Path,
    file: &mut File,
    state: &mut FollowState,
    poll_interval: Duration,
    buf: &mut [u8],
) -> Result<usize, SourceError> {
    loop {
        let n = file.read(buf).await.map_err(|e| SourceError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;

        if n > 0 {
            state.position = state.position.saturating_add(n as u64);
            return Ok(n);
        }

        check_in_place(path, file, state).await?;
        sleep(poll_interval).await;
    }
}

/// Verifies a followed file has not been truncated, removed or replaced.
async fn check_in_place(path: &Path, file: &File, state: &FollowState) -> Result<(), SourceError> {
    let len = file
        .metadata()
        .await
        .map_err(|e| SourceError::Read {
            path: path.to_path_buf(),
            source: e,
        })?
        .len();

    if len < state.position {
        return Err(SourceError::Truncated {
            path: path.to_path_buf(),
            position: state.position,
            len,
        });
    }

    match tokio::fs::metadata(path).await {
        Ok(current) if current.dev() == state.dev && current.ino() == state.ino => Ok(()),
        Ok(_) => Err(SourceError::Rotated {
            path: path.to_path_buf(),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(SourceError::Removed {
            path: path.to_path_buf(),
        }),
        Err(e) => Err(SourceError::Read {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Errors that can occur while opening or reading the source.
///
/// `Open` happens before a session starts. Every other variant is a read
/// failure that ends the current session.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Failed to open source {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read source {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Source {path} reached end of stream")]
    EndOfStream { path: PathBuf },

    #[error("Source {path} was truncated to {len} bytes (read position {position})")]
    Truncated {
        path: PathBuf,
        position: u64,
        len: u64,
    },

    #[error("Source {path} was removed")]
    Removed { path: PathBuf },

    #[error("Source {path} was replaced by a different file")]
    Rotated { path: PathBuf },
}

impl SourceError {
    fn open(path: &Path, source: io::Error) -> Self {
        Self::Open {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Returns true if the source could not be opened at all.
    pub fn is_open_error(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}
