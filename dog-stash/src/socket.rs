//! Persistent-socket uploads: a filename frame, one or more binary frames,
//! then an end marker, repeated for as many files as the peer likes.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

use crate::shared::StashCore;
use crate::ingest::IngestSession;
use crate::{AccountId, BoxStream, ByteSource, FileRef, StashError, StashResult};

/// One message off a duplex channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketFrame {
    /// Starts a new file
    Name(String),
    /// Payload bytes of the current file
    Binary(Bytes),
    /// Current file is complete
    End,
}

/// The receiving half of a long-lived connection
#[async_trait]
pub trait SocketChannel: Send {
    /// Next frame, or `None` once the peer has disconnected
    async fn recv(&mut self) -> Option<SocketFrame>;
}

/// Binary frames of a single file, read off a shared channel
pub(crate) struct FrameSource<'a, C: SocketChannel> {
    channel: &'a mut C,
    finished: bool,
    /// Filename frame that cut the current file short
    next_name: Option<String>,
}

impl<'a, C: SocketChannel> FrameSource<'a, C> {
    pub(crate) fn new(channel: &'a mut C) -> Self {
        Self {
            channel,
            finished: false,
            next_name: None,
        }
    }

    /// Skip whatever is left of the current file so the next filename frame
    /// lines up. Returns `false` if the peer went away meanwhile.
    async fn drain(&mut self) -> bool {
        while !self.finished {
            match self.channel.recv().await {
                Some(SocketFrame::End) => self.finished = true,
                Some(SocketFrame::Name(name)) => {
                    self.finished = true;
                    self.next_name = Some(name);
                }
                Some(SocketFrame::Binary(_)) => {}
                None => return false,
            }
        }
        true
    }
}

#[async_trait]
impl<C: SocketChannel> ByteSource for FrameSource<'_, C> {
    async fn next(&mut self) -> StashResult<Option<Bytes>> {
        if self.finished {
            return Ok(None);
        }
        match self.channel.recv().await {
            Some(SocketFrame::Binary(bytes)) => Ok(Some(bytes)),
            Some(SocketFrame::End) => {
                self.finished = true;
                Ok(None)
            }
            Some(SocketFrame::Name(name)) => {
                // the current file is cut short; the new name starts the next one
                self.finished = true;
                self.next_name = Some(name);
                Err(StashError::invalid("filename frame before end of file"))
            }
            None => {
                self.finished = true;
                Err(StashError::aborted("peer disconnected mid-file"))
            }
        }
    }
}

/// Run one ingest session per file announced on `channel`.
///
/// Every file yields exactly one item. A filename frame that arrives before the
/// current file's end marker fails the current file and starts the next. The
/// stream ends when the peer disconnects; a disconnect mid-file yields that
/// file's `Aborted` error first.
pub(crate) fn ingest_frames<C>(
    core: Arc<StashCore>,
    account: AccountId,
    mut channel: C,
) -> BoxStream<StashResult<FileRef>>
where
    C: SocketChannel + 'static,
{
    Box::pin(async_stream::stream! {
        let mut pending: Option<String> = None;
        loop {
            let name = match pending.take() {
                Some(name) => name,
                None => match channel.recv().await {
                    Some(SocketFrame::Name(name)) => name,
                    Some(SocketFrame::End) => continue,
                    Some(SocketFrame::Binary(_)) => {
                        yield Err(StashError::invalid("binary frame before filename"));
                        break;
                    }
                    None => break,
                },
            };

            let mut session = IngestSession::new(core.clone(), account.clone(), name);
            let mut source = FrameSource::new(&mut channel);
            let outcome = session.run(&mut source, None).await;
            let connected = match &outcome {
                Err(StashError::Aborted { .. }) => false,
                _ => source.drain().await,
            };
            pending = source.next_name.take();
            yield outcome;
            if !connected {
                debug!(account = %account, "socket upload channel closed");
                break;
            }
        }
    })
}
