use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;

use crate::{ByteStream, StashError, StashResult};

/// Ordered byte ranges from one transport.
///
/// `Ok(Some(bytes))` is the next range, `Ok(None)` the end of the file, and
/// `Err(_)` means the transport gave up (disconnect, client abort, read
/// failure). Callers stop pulling after the first `Ok(None)` or `Err`.
#[async_trait]
pub trait ByteSource: Send {
    async fn next(&mut self) -> StashResult<Option<Bytes>>;

    /// Total length, when the transport knows it before sending
    fn size_hint(&self) -> Option<u64> {
        None
    }
}

/// Whole payload already in memory
pub struct BufferedSource {
    data: Option<Bytes>,
    len: u64,
}

impl BufferedSource {
    pub fn new<B: Into<Bytes>>(data: B) -> Self {
        let data = data.into();
        let len = data.len() as u64;
        Self {
            data: Some(data),
            len,
        }
    }
}

#[async_trait]
impl ByteSource for BufferedSource {
    async fn next(&mut self) -> StashResult<Option<Bytes>> {
        Ok(self.data.take().filter(|d| !d.is_empty()))
    }

    fn size_hint(&self) -> Option<u64> {
        Some(self.len)
    }
}

/// Body of unknown length, e.g. a chunked request body
pub struct StreamSource {
    stream: ByteStream,
    on_error: fn(std::io::Error) -> StashError,
}

impl StreamSource {
    /// A client stream: read errors mean the peer went away
    pub fn new(stream: ByteStream) -> Self {
        Self {
            stream,
            on_error: |e| StashError::aborted(e.to_string()),
        }
    }

    /// A stream backed by our own storage: read errors are storage failures
    pub fn from_storage(stream: ByteStream) -> Self {
        Self {
            stream,
            on_error: StashError::from,
        }
    }
}

#[async_trait]
impl ByteSource for StreamSource {
    async fn next(&mut self) -> StashResult<Option<Bytes>> {
        match self.stream.next().await {
            Some(Ok(bytes)) => Ok(Some(bytes)),
            Some(Err(e)) => Err((self.on_error)(e)),
            None => Ok(None),
        }
    }
}

/// Counts what passes through and stops once the running total exceeds `limit`
pub(crate) struct MeteredSource<'a, 'b> {
    inner: &'a mut (dyn ByteSource + 'b),
    limit: u64,
    received: u64,
}

impl<'a, 'b> MeteredSource<'a, 'b> {
    pub(crate) fn new(inner: &'a mut (dyn ByteSource + 'b), limit: u64) -> Self {
        Self {
            inner,
            limit,
            received: 0,
        }
    }

    pub(crate) fn received(&self) -> u64 {
        self.received
    }
}

#[async_trait]
impl ByteSource for MeteredSource<'_, '_> {
    async fn next(&mut self) -> StashResult<Option<Bytes>> {
        let chunk = self.inner.next().await?;
        if let Some(bytes) = &chunk {
            self.received += bytes.len() as u64;
            if self.received > self.limit {
                return Err(StashError::PayloadTooLarge {
                    size: self.received,
                    max: self.limit,
                });
            }
        }
        Ok(chunk)
    }

    fn size_hint(&self) -> Option<u64> {
        self.inner.size_hint()
    }
}

/// Drain a source into one buffer
pub async fn collect(source: &mut (dyn ByteSource + '_)) -> StashResult<Bytes> {
    let mut buf = bytes::BytesMut::new();
    while let Some(chunk) = source.next().await? {
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}
