//! TCP neighbor links.
//!
//! Each connection opens with a hello carrying the sender's peer id, then
//! carries mesh packets as length-prefixed frames in both directions. A
//! connection is one [`ChannelLink`] on the node; when it drops the link is
//! detached.

use anyhow::{bail, Context, Result};
use bytes::{Bytes, BytesMut};
use mesh_node::wire::PeerId;
use mesh_node::{ChannelLink, MeshNode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Connection preamble
const HELLO_MAGIC: &[u8; 4] = b"MSH1";

/// Largest frame accepted from a neighbor
pub const MAX_FRAME_SIZE: usize = 128 * 1024;

/// Delay between dial attempts to a configured neighbor
const REDIAL_INTERVAL: Duration = Duration::from_secs(5);

/// Aborts the wrapped task when dropped, on every exit path
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Send our hello and read the neighbor's
pub async fn exchange_hello<S>(stream: &mut S, local: PeerId) -> Result<PeerId>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut hello = [0u8; 12];
    hello[..4].copy_from_slice(HELLO_MAGIC);
    hello[4..].copy_from_slice(local.as_bytes());
    stream.write_all(&hello).await.context("Failed to send hello")?;
    stream.flush().await?;

    let mut remote = [0u8; 12];
    stream
        .read_exact(&mut remote)
        .await
        .context("Failed to read hello")?;
    if &remote[..4] != HELLO_MAGIC {
        bail!("Unexpected hello preamble");
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&remote[4..]);
    let peer = PeerId::new(id);
    if peer == local {
        bail!("Neighbor announced our own peer id");
    }
    Ok(peer)
}

/// Write one length-prefixed frame
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if frame.len() > MAX_FRAME_SIZE {
        bail!("Frame of {} bytes exceeds {}", frame.len(), MAX_FRAME_SIZE);
    }
    writer.write_u32(frame.len() as u32).await?;
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame; `None` on a clean end of stream
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        bail!("Frame of {} bytes exceeds {}", len, MAX_FRAME_SIZE);
    }
    let mut buf = BytesMut::zeroed(len);
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf.freeze()))
}

/// Run one neighbor connection until it closes
pub async fn run_connection(node: Arc<MeshNode>, mut stream: TcpStream, link_buffer: usize) -> Result<()> {
    let addr = stream.peer_addr()?;
    let peer = exchange_hello(&mut stream, node.local_id()).await?;
    info!(peer = %peer, addr = %addr, "Neighbor connected");

    let (mut reader, mut writer) = stream.into_split();
    let (link, mut outbound) = ChannelLink::pair(link_buffer);

    let _writer = AbortOnDrop(tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                warn!(peer = %peer, error = %e, "Neighbor write failed");
                break;
            }
        }
    }));

    if let Err(e) = node.attach_link(peer, Arc::new(link)).await {
        node.detach_link(&peer);
        return Err(e).context("Failed to attach neighbor link");
    }

    let result = loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                let outcome = node.handle_inbound(peer, frame).await;
                debug!(peer = %peer, ?outcome, "Frame processed");
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    node.detach_link(&peer);
    info!(peer = %peer, addr = %addr, "Neighbor disconnected");
    result
}

/// Accept neighbor connections forever
pub async fn serve(node: Arc<MeshNode>, listener: TcpListener, link_buffer: usize) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(addr = %addr, "Accepted connection");
                let node = Arc::clone(&node);
                tokio::spawn(async move {
                    if let Err(e) = run_connection(node, stream, link_buffer).await {
                        warn!(addr = %addr, error = %e, "Connection ended with error");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Keep a connection to `addr` up, redialing after failures
pub async fn dial(node: Arc<MeshNode>, addr: SocketAddr, link_buffer: usize) {
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                if let Err(e) = run_connection(Arc::clone(&node), stream, link_buffer).await {
                    warn!(addr = %addr, error = %e, "Connection ended with error");
                }
            }
            Err(e) => debug!(addr = %addr, error = %e, "Dial failed"),
        }
        tokio::time::sleep(REDIAL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_hello_exchange() {
        let (mut left, mut right) = duplex(64);
        let a = PeerId::from_u64(1);
        let b = PeerId::from_u64(2);

        let (from_left, from_right) = tokio::join!(
            exchange_hello(&mut left, a),
            exchange_hello(&mut right, b)
        );
        assert_eq!(from_left.unwrap(), b);
        assert_eq!(from_right.unwrap(), a);
    }

    #[tokio::test]
    async fn test_hello_rejects_bad_preamble() {
        let (mut left, mut right) = duplex(64);
        right.write_all(b"HTTP/1.1 200").await.unwrap();
        assert!(exchange_hello(&mut left, PeerId::from_u64(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_frames() {
        let (mut left, mut right) = duplex(4096);
        write_frame(&mut left, b"first").await.unwrap();
        write_frame(&mut left, b"").await.unwrap();
        drop(left);

        assert_eq!(
            read_frame(&mut right).await.unwrap(),
            Some(Bytes::from_static(b"first"))
        );
        assert_eq!(read_frame(&mut right).await.unwrap(), Some(Bytes::new()));
        assert_eq!(read_frame(&mut right).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_writer_aborted_on_drop() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let guard = AbortOnDrop(tokio::spawn(async move {
            let _held = tx;
            std::future::pending::<()>().await;
        }));

        drop(guard);
        // the sender is released only when the task is torn down
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut left, mut right) = duplex(64);
        left.write_u32(MAX_FRAME_SIZE as u32 + 1).await.unwrap();
        assert!(read_frame(&mut right).await.is_err());

        let big = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(write_frame(&mut left, &big).await.is_err());
    }
}
