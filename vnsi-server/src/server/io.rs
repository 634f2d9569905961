//! Deadline-bounded reads from the client socket.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Result of a bounded read.
#[derive(Debug)]
pub enum ReadOutcome {
    Complete,
    /// Peer closed the connection, possibly mid-read.
    Closed,
    TimedOut,
    Failed(io::Error),
}

/// Fill `buf` completely, giving up after `deadline` if one is set.
pub async fn read_exact_deadline<R>(reader: &mut R, buf: &mut [u8], deadline: Option<Duration>) -> ReadOutcome
where
    R: AsyncRead + Unpin,
{
    let read = reader.read_exact(buf);
    let result = match deadline {
        Some(limit) => match tokio::time::timeout(limit, read).await {
            Ok(result) => result,
            Err(_) => return ReadOutcome::TimedOut,
        },
        None => read.await,
    };
    match result {
        Ok(_) => ReadOutcome::Complete,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => ReadOutcome::Closed,
        Err(e) => ReadOutcome::Failed(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_complete_read() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[1, 2, 3, 4]).await.unwrap();
        let mut buf = [0u8; 4];
        let outcome = read_exact_deadline(&mut server, &mut buf, Some(Duration::from_secs(1))).await;
        assert!(matches!(outcome, ReadOutcome::Complete));
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_partial_then_close() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[1, 2]).await.unwrap();
        drop(client);
        let mut buf = [0u8; 4];
        assert!(matches!(
            read_exact_deadline(&mut server, &mut buf, None).await,
            ReadOutcome::Closed
        ));
    }

    #[tokio::test]
    async fn test_deadline_expires() {
        let (_client, mut server) = tokio::io::duplex(64);
        let mut buf = [0u8; 4];
        assert!(matches!(
            read_exact_deadline(&mut server, &mut buf, Some(Duration::from_millis(50))).await,
            ReadOutcome::TimedOut
        ));
    }
}
