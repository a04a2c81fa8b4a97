//! Per-neighbor link primitive

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Link write failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The other end is gone
    #[error("link closed")]
    Closed,

    /// The neighbor's outbound queue has no room
    #[error("link queue full")]
    Full,

    /// The write itself failed
    #[error("write failed: {0}")]
    Write(String),
}

/// Write side of a link to one direct neighbor.
///
/// One call carries one whole packet. Inbound bytes are handed to
/// [`crate::MeshNode::handle_inbound`] by whoever owns the read side.
#[async_trait]
pub trait Link: Send + Sync + fmt::Debug {
    /// Write one packet, waiting for room
    async fn write(&self, frame: Bytes) -> Result<(), LinkError>;

    /// Write one packet only if it can be taken right away.
    ///
    /// Fails with [`LinkError::Full`] instead of waiting; used on the
    /// inbound path, where a stalled neighbor must not stall the reader.
    fn try_write(&self, frame: Bytes) -> Result<(), LinkError>;
}

/// Link that hands frames to a bounded channel
#[derive(Debug, Clone)]
pub struct ChannelLink {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelLink {
    /// Wrap an existing sender
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }

    /// Link plus the receiver its frames arrive on
    pub fn pair(buffer: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Link for ChannelLink {
    async fn write(&self, frame: Bytes) -> Result<(), LinkError> {
        self.tx.send(frame).await.map_err(|_| LinkError::Closed)
    }

    fn try_write(&self, frame: Bytes) -> Result<(), LinkError> {
        self.tx.try_send(frame).map_err(|err| match err {
            TrySendError::Full(_) => LinkError::Full,
            TrySendError::Closed(_) => LinkError::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_link() {
        let (link, mut rx) = ChannelLink::pair(4);
        link.write(Bytes::from_static(b"frame")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"frame"));

        drop(rx);
        assert_eq!(
            link.write(Bytes::from_static(b"late")).await,
            Err(LinkError::Closed)
        );
    }

    #[tokio::test]
    async fn test_try_write_never_waits() {
        let (link, mut rx) = ChannelLink::pair(1);
        link.try_write(Bytes::from_static(b"first")).unwrap();
        assert_eq!(
            link.try_write(Bytes::from_static(b"second")),
            Err(LinkError::Full)
        );

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"first"));
        link.try_write(Bytes::from_static(b"third")).unwrap();

        drop(rx);
        assert_eq!(
            link.try_write(Bytes::from_static(b"late")),
            Err(LinkError::Closed)
        );
    }
}
