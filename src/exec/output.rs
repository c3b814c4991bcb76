// src/exec/output.rs

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::debug;

/// Consume a child's output stream so its buffer never fills, logging each
/// line at debug level.
pub fn spawn_line_logger<R>(reader: R, stream: &'static str, pid: u32) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(pid, stream, "{}", line);
        }
        debug!(pid, stream, "output stream closed");
    })
}
