//! Duplex byte bridge
//!
//! Copies bytes in both directions between two [`DuplexStream`]s until either
//! direction ends. The same code serves socket-to-tunnel on the nodes and
//! tunnel-to-tunnel on the relay.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinError;
use tracing::{debug, error, trace};

use crate::{ChunkRead, ChunkWrite, DuplexStream, TransportError, TransportResult};

/// Bytes moved by a finished bridge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

enum Finished {
    Forward(Result<TransportResult<()>, JoinError>),
    Backward(Result<TransportResult<()>, JoinError>),
}

/// Bridge `a` and `b` until one direction terminates.
///
/// Each direction runs in its own task. When one ends (close, read error or
/// write error) its writer is closed and the other task is aborted, which
/// drops the remaining halves and closes both streams.
pub async fn bridge<A, B>(a: A, b: B) -> TransportResult<BridgeStats>
where
    A: DuplexStream,
    B: DuplexStream,
{
    let (a_read, a_write) = a.split();
    let (b_read, b_write) = b.split();

    let a_to_b = Arc::new(AtomicU64::new(0));
    let b_to_a = Arc::new(AtomicU64::new(0));

    let mut forward = tokio::spawn(copy(a_read, b_write, a_to_b.clone()));
    let mut backward = tokio::spawn(copy(b_read, a_write, b_to_a.clone()));

    let finished = tokio::select! {
        result = &mut forward => Finished::Forward(result),
        result = &mut backward => Finished::Backward(result),
    };

    let (result, remaining, direction) = match finished {
        Finished::Forward(result) => (result, backward, "a->b"),
        Finished::Backward(result) => (result, forward, "b->a"),
    };

    remaining.abort();
    let _ = remaining.await;

    let stats = BridgeStats {
        a_to_b: a_to_b.load(Ordering::Relaxed),
        b_to_a: b_to_a.load(Ordering::Relaxed),
    };

    match result {
        Ok(Ok(())) => {
            debug!(
                direction,
                a_to_b = stats.a_to_b,
                b_to_a = stats.b_to_a,
                "Bridge finished"
            );
            Ok(stats)
        }
        Ok(Err(e)) => {
            debug!(direction, "Bridge ended with error: {}", e);
            Err(e)
        }
        Err(e) => {
            error!(direction, "Bridge copy task failed: {}", e);
            Err(TransportError::TaskFailed(e.to_string()))
        }
    }
}

async fn copy<R, W>(mut reader: R, mut writer: W, counter: Arc<AtomicU64>) -> TransportResult<()>
where
    R: ChunkRead,
    W: ChunkWrite,
{
    let result = async {
        while let Some(chunk) = reader.read_chunk().await? {
            writer.write_chunk(&chunk).await?;
            counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
        Ok::<(), TransportError>(())
    }
    .await;

    if let Err(e) = writer.close().await {
        trace!("Closing writer after copy failed: {}", e);
    }

    result
}
