//! Newline-delimited JSON transport: one message per line in, one per line out.

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bridge::{Bridge, BridgeError, BridgeHandle, BridgeOptions};
use crate::loader::EngineLoader;
use crate::message::OutboundMessage;

/// Serves a bridge over stdin/stdout until stdin closes, the bridge closes
/// (single-use protocol) or ctrl-c.
pub async fn serve_stdio(loader: EngineLoader, options: BridgeOptions) -> Result<()> {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    let (handle, replies) = Bridge::spawn(loader, options);
    tokio::select! {
        res = serve(handle, replies, stdin, stdout) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
    }
}

/// Pumps `input` lines into `handle` and replies from `replies` into `output`.
/// Returns once every reply has been written.
pub async fn serve<R, W>(
    handle: BridgeHandle,
    mut replies: mpsc::Receiver<OutboundMessage>,
    input: R,
    mut output: W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let reader = tokio::spawn(read_requests(handle, input));

    while let Some(reply) = replies.recv().await {
        let mut line = serde_json::to_vec(&reply).context("could not encode reply")?;
        line.push(b'\n');
        output.write_all(&line).await.context("could not write reply")?;
        output.flush().await?;
    }

    reader.abort();
    Ok(())
}

async fn read_requests<R>(handle: BridgeHandle, input: R)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = handle.closed() => {
                debug!("bridge closed, no longer reading input");
                break;
            }
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("input closed");
                break;
            }
            Err(e) => {
                warn!("could not read input: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(e) => {
                warn!("skipping malformed line: {e}");
                continue;
            }
        };
        match handle.post_json(value).await {
            Ok(()) => {}
            Err(BridgeError::Closed) => break,
            Err(e) => warn!("skipping message: {e}"),
        }
    }
    // dropping the last handle lets a persistent bridge finish in-flight jobs and stop
}
