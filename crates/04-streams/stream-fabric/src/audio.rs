//! Audio chunk publisher: ordered `(metadata, binary)` pairs.

use crate::publisher::{Publisher, PublishOutcome, Subscription, DEFAULT_QUEUE_CAPACITY};
use engine_abi::{AudioChunkMeta, AudioFormat, EngineError, EventStamp, Payload};
use std::sync::Arc;

/// One audio chunk event, metadata before bytes on the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioChunk {
    pub meta: AudioChunkMeta,
    pub data: Payload,
}

pub struct AudioPublisher {
    inner: Publisher<AudioChunk>,
    next_chunk_id: u64,
}

impl AudioPublisher {
    pub fn channel() -> (AudioPublisher, Subscription<AudioChunk>) {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (AudioPublisher, Subscription<AudioChunk>) {
        let (inner, subscription) = Publisher::channel(capacity);
        (
            AudioPublisher {
                inner,
                next_chunk_id: 1,
            },
            subscription,
        )
    }

    pub fn inner(&self) -> &Publisher<AudioChunk> {
        &self.inner
    }

    /// Publishes a chunk; `payload_bytes` must equal
    /// `frames * channels * bytes_per_sample` exactly.
    pub fn publish_chunk(
        &mut self,
        stamp: EventStamp,
        sample_rate: u32,
        channels: u8,
        format: AudioFormat,
        frames: u32,
        data: Arc<[u8]>,
    ) -> Result<PublishOutcome, EngineError> {
        let expected = frames as usize * channels as usize * format.bytes_per_sample();
        if data.len() != expected {
            return Err(EngineError::internal(format!(
                "audio payload is {} bytes, metadata declares {expected}",
                data.len()
            )));
        }
        let meta = AudioChunkMeta {
            chunk_id: self.next_chunk_id,
            sample_rate,
            channels,
            format,
            frames,
            payload_bytes: expected,
        };
        self.next_chunk_id += 1;
        Ok(self.inner.publish(stamp, AudioChunk { meta, data }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_metadata_matches_payload() {
        let (mut publisher, subscription) = AudioPublisher::with_capacity(4);
        let frames = 800u32;
        let data: Arc<[u8]> = Arc::from(vec![0u8; frames as usize * 2 * 2].into_boxed_slice());
        publisher
            .publish_chunk(
                EventStamp::default(),
                48_000,
                2,
                AudioFormat::PcmS16le,
                frames,
                data,
            )
            .expect("chunk");
        let event = subscription.try_next().expect("event");
        assert_eq!(event.payload.meta.chunk_id, 1);
        assert_eq!(event.payload.meta.payload_bytes, 3200);
    }

    #[test]
    fn byte_count_mismatch_is_fatal() {
        let (mut publisher, _subscription) = AudioPublisher::with_capacity(4);
        let data: Arc<[u8]> = Arc::from(vec![0u8; 10].into_boxed_slice());
        let err = publisher
            .publish_chunk(
                EventStamp::default(),
                48_000,
                2,
                AudioFormat::PcmF32le,
                100,
                data,
            )
            .expect_err("mismatch");
        assert_eq!(err.code, engine_abi::ErrorCode::InternalError);
    }
}
