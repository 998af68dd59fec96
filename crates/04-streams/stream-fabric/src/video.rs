//! Video frame publisher: ordered `(metadata, binary)` pairs.

use crate::publisher::{Publisher, PublishOutcome, Subscription, DEFAULT_QUEUE_CAPACITY};
use engine_abi::{EngineError, EventStamp, Payload, PixelFormat, VideoFrameMeta};
use std::sync::Arc;

/// One frame event; the transport splits it into its metadata and binary
/// wire messages, in that order.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoFrame {
    pub meta: VideoFrameMeta,
    pub data: Payload,
}

pub struct VideoPublisher {
    inner: Publisher<VideoFrame>,
    next_frame_id: u64,
}

impl VideoPublisher {
    pub fn channel() -> (VideoPublisher, Subscription<VideoFrame>) {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (VideoPublisher, Subscription<VideoFrame>) {
        let (inner, subscription) = Publisher::channel(capacity);
        (
            VideoPublisher {
                inner,
                next_frame_id: 1,
            },
            subscription,
        )
    }

    pub fn inner(&self) -> &Publisher<VideoFrame> {
        &self.inner
    }

    /// Publishes a frame, enforcing the byte-exact payload contract.
    ///
    /// A mismatch between the declared dimensions/format and the payload
    /// length is a fail-fast internal error, never a degraded delivery.
    pub fn publish_frame(
        &mut self,
        stamp: EventStamp,
        width: u16,
        height: u16,
        pixel_format: PixelFormat,
        data: Arc<[u8]>,
    ) -> Result<PublishOutcome, EngineError> {
        let expected = width as usize * height as usize * pixel_format.bytes_per_pixel();
        if data.len() != expected {
            return Err(EngineError::internal(format!(
                "video payload is {} bytes, metadata declares {expected}",
                data.len()
            )));
        }
        let meta = VideoFrameMeta {
            frame_id: self.next_frame_id,
            width,
            height,
            pixel_format,
            payload_bytes: expected,
        };
        self.next_frame_id += 1;
        Ok(self.inner.publish(stamp, VideoFrame { meta, data }))
    }
}
