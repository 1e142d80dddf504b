//! Length-delimited framing over a byte stream
//!
//! ```text
//! +-------------------------------+---------------------------+
//! | Length (4 bytes, big-endian)  | Payload (bincode message) |
//! +-------------------------------+---------------------------+
//! ```

use super::schema;
use crate::error::{ServeError, ServeResult};
use bytes::{Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Default upper bound for one frame
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Codec that rejects frames above `max_frame_bytes`
pub fn frame_codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(max_frame_bytes)
        .new_codec()
}

/// Wrap an I/O object in the frame codec
pub fn framed<T>(io: T, max_frame_bytes: usize) -> Framed<T, LengthDelimitedCodec>
where
    T: AsyncRead + AsyncWrite,
{
    Framed::new(io, frame_codec(max_frame_bytes))
}

/// Encode `msg` and write it as one frame
pub async fn send_message<S, T>(sink: &mut S, msg: &T) -> ServeResult<()>
where
    S: Sink<Bytes, Error = io::Error> + Unpin,
    T: Serialize,
{
    let payload = schema::encode(msg)?;
    sink.send(Bytes::from(payload))
        .await
        .map_err(|e| ServeError::Protocol(format!("write failed: {e}")))
}

/// Read one frame and decode it; `None` when the peer closed the stream
pub async fn recv_message<S, T>(stream: &mut S) -> ServeResult<Option<T>>
where
    S: Stream<Item = io::Result<BytesMut>> + Unpin,
    T: DeserializeOwned,
{
    match stream.next().await {
        None => Ok(None),
        Some(Err(e)) => Err(ServeError::Protocol(format!("read failed: {e}"))),
        Some(Ok(frame)) => schema::decode(&frame).map(Some),
    }
}
