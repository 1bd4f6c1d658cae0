//! `text/event-stream` framing over `eventsource-stream`.
//!
//! The backend splits one JSON payload across consecutive `data:` lines and
//! expects them concatenated verbatim. The WHATWG parser joins them with
//! `\n`; a field value never contains a line break, so dropping every `\n`
//! restores the payload as sent.

use eventsource_stream::{EventStreamError, Eventsource};
use futures::stream::{BoxStream, StreamExt};

use crate::client::ByteStream;
use crate::error::{SyncError, SyncResult};

/// One dispatched frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub event: String,
    pub id: String,
    pub data: String,
}

pub type FrameStream = BoxStream<'static, SyncResult<Frame>>;

/// Decodes a raw response body into frames. Comments and frames without
/// `data` never surface; transport errors pass through unchanged.
pub fn frames(body: ByteStream) -> FrameStream {
    body.eventsource()
        .map(|item| match item {
            Ok(event) => Ok(Frame {
                event: event.event,
                id: event.id,
                data: event.data.replace('\n', ""),
            }),
            Err(EventStreamError::Transport(err)) => Err(err),
            Err(err) => Err(SyncError::Decode(format!("malformed event stream: {err}"))),
        })
        .boxed()
}
