//! Framed SMUX streams for async I/O.
//!
//! Split stream types over the two halves of a transport:
//! - `FrameReader<T>` - read-only stream for receiving frames
//! - `FrameWriter<T>` - write-only sink for sending frames
//!
//! The session multiplexer owns one `FrameReader` (driven by its inbound
//! dispatch loop) and shares one `FrameWriter` among all sessions.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use futures_util::Sink;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::CodecError;
use crate::frame_codec::{Frame, SmuxCodec};

pin_project! {
    /// A read-only stream of SMUX frames.
    pub struct FrameReader<T> {
        #[pin]
        inner: FramedRead<T, SmuxCodec>,
    }
}

impl<T> FrameReader<T>
where
    T: AsyncRead,
{
    /// Create a new frame reader over the given transport half.
    pub fn new(transport: T) -> Self {
        Self {
            inner: FramedRead::new(transport, SmuxCodec::new()),
        }
    }

    /// Create a new frame reader with a custom codec.
    pub fn with_codec(transport: T, codec: SmuxCodec) -> Self {
        Self {
            inner: FramedRead::new(transport, codec),
        }
    }

    /// Get a reference to the underlying transport half.
    pub fn get_ref(&self) -> &T {
        self.inner.get_ref()
    }

    /// Get a reference to the codec.
    pub fn codec(&self) -> &SmuxCodec {
        self.inner.decoder()
    }
}

impl<T> Stream for FrameReader<T>
where
    T: AsyncRead + Unpin,
{
    type Item = Result<Frame, CodecError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }
}

impl<T> std::fmt::Debug for FrameReader<T>
where
    T: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReader")
            .field("transport", self.inner.get_ref())
            .finish()
    }
}

pin_project! {
    /// A write-only sink of SMUX frames.
    pub struct FrameWriter<T> {
        #[pin]
        inner: FramedWrite<T, SmuxCodec>,
    }
}

impl<T> FrameWriter<T>
where
    T: AsyncWrite,
{
    /// Create a new frame writer over the given transport half.
    pub fn new(transport: T) -> Self {
        Self {
            inner: FramedWrite::new(transport, SmuxCodec::new()),
        }
    }

    /// Create a new frame writer with a custom codec.
    pub fn with_codec(transport: T, codec: SmuxCodec) -> Self {
        Self {
            inner: FramedWrite::new(transport, codec),
        }
    }

    /// Get a reference to the underlying transport half.
    pub fn get_ref(&self) -> &T {
        self.inner.get_ref()
    }

    /// Get a reference to the codec.
    pub fn codec(&self) -> &SmuxCodec {
        self.inner.encoder()
    }
}

impl<T> Sink<Frame> for FrameWriter<T>
where
    T: AsyncWrite + Unpin,
{
    type Error = CodecError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_ready(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: Frame) -> Result<(), Self::Error> {
        self.project().inner.start_send(item)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_close(cx)
    }
}

impl<T> std::fmt::Debug for FrameWriter<T>
where
    T: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter")
            .field("transport", self.inner.get_ref())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use bytes::Bytes;
    use futures_util::{SinkExt, StreamExt};
    use smux_protocol::{SmuxFlags, SmuxHeader};

    use super::*;

    #[tokio::test]
    async fn test_reader_writer_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        let header = SmuxHeader::data(1, 0, 4, 5);
        writer
            .send(Frame::new(header, Bytes::from_static(b"query")))
            .await
            .unwrap();

        let frame = reader.next().await.unwrap().unwrap();
        assert_eq!(frame.header.session_id, 1);
        assert_eq!(&frame.payload[..], b"query");
    }

    #[tokio::test]
    async fn test_reader_sees_frames_in_order() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        for seq in 0..3u32 {
            let header = SmuxHeader::data(1, seq, 4, 1);
            writer
                .send(Frame::new(header, Bytes::from_static(b"x")))
                .await
                .unwrap();
        }
        writer
            .send(Frame::control(SmuxHeader::control(SmuxFlags::FIN, 1, 2, 4)))
            .await
            .unwrap();

        for seq in 0..3u32 {
            let frame = reader.next().await.unwrap().unwrap();
            assert_eq!(frame.header.sequence_number, seq);
            assert_eq!(frame.header.flags, SmuxFlags::DATA);
        }
        let fin = reader.next().await.unwrap().unwrap();
        assert_eq!(fin.header.flags, SmuxFlags::FIN);
    }
}
