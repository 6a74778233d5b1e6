//! File reconstruction from an ordered payload stream.

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::TransferError;

/// Append payloads to `file` until an empty payload arrives.
///
/// Payloads are delivered in header order by the receiver loop. An empty
/// payload is the close signal; the file is flushed and the task ends.
/// A closed channel counts as a close signal too.
pub async fn reconstruct(
    mut file: File,
    mut payloads: mpsc::Receiver<Bytes>,
) -> Result<(), TransferError> {
    while let Some(payload) = payloads.recv().await {
        if payload.is_empty() {
            break;
        }
        file.write_all(&payload).await?;
        debug!(bytes = payload.len(), "reconstruct: appended payload");
    }
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn writes_payloads_until_empty_signal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let file = File::create(&path).await.unwrap();

        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(reconstruct(file, rx));

        tx.send(Bytes::from_static(b"hello ")).await.unwrap();
        tx.send(Bytes::from_static(b"world")).await.unwrap();
        tx.send(Bytes::new()).await.unwrap();

        task.await.unwrap().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn dropped_channel_closes_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        let file = File::create(&path).await.unwrap();

        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(reconstruct(file, rx));

        tx.send(Bytes::from_static(b"partial")).await.unwrap();
        drop(tx);

        task.await.unwrap().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"partial");
    }
}
