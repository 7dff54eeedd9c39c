//! Async line pump: reads raw log bytes, writes formatted lines.

use std::io;

use chrono::Local;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::format::LineFormatter;

/// Errors that can occur while formatting a stream.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Failed to read input: {0}")]
    Read(#[source] io::Error),

    #[error("Failed to write output: {0}")]
    Write(#[source] io::Error),
}

/// Formats every line from `reader` into `writer` until end of input.
///
/// Input is treated as bytes; invalid UTF-8 is replaced rather than
/// rejected. A final line without a trailing newline is still printed.
/// Returns the number of lines written.
pub async fn format_stream<R, W>(
    reader: &mut R,
    writer: &mut W,
    formatter: &LineFormatter,
) -> Result<u64, StreamError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = Vec::new();
    let mut written = 0u64;

    loop {
        line.clear();
        let n = reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(StreamError::Read)?;
        if n == 0 {
            break;
        }

        let text = String::from_utf8_lossy(&line);
        if let Some(formatted) = formatter.format_line(&text, &Local::now()) {
            writer
                .write_all(formatted.as_bytes())
                .await
                .map_err(StreamError::Write)?;
            writer.write_all(b"\n").await.map_err(StreamError::Write)?;
            writer.flush().await.map_err(StreamError::Write)?;
            written += 1;
        }
    }

    Ok(written)
}
