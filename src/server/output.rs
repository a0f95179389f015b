// src/server/output.rs

//! The output sink of the binary: completed records as JSON lines.

use crate::core::message::Message;
use anyhow::{Context, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::info;

/// Writes every record received on `rx` to `writer`, one JSON object per
/// line, until all senders are gone. Returns the number of records written.
pub async fn write_json_lines<W>(mut rx: mpsc::UnboundedReceiver<Message>, mut writer: W) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;
    while let Some(msg) = rx.recv().await {
        let mut line = serde_json::to_vec(&msg).context("Failed to encode record")?;
        line.push(b'\n');
        writer
            .write_all(&line)
            .await
            .context("Failed to write record")?;
        written += 1;
    }
    writer.flush().await.context("Failed to flush output")?;
    info!("Output closed after {} records.", written);
    Ok(written)
}
