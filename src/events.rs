//! Typed messages passed between the pipeline tasks

/// One tick of captured audio (16-bit mono PCM).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Capture sequence number, monotonically increasing per source
    pub sequence: u64,
    pub samples: Vec<i16>,
}

impl AudioFrame {
    pub fn new(sequence: u64, samples: Vec<i16>) -> Self {
        Self { sequence, samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Little-endian byte view of the samples, as sent on the wire.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * 2);
        for sample in &self.samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes
    }
}

/// Episode control signals delivered to the streaming engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeControl {
    /// End live capture now and send the command end
    Stop,
}

/// One piece of a (possibly fragmented) inbound text message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Byte offset of this payload within the full message
    pub offset: usize,
    /// Declared length of the full message
    pub total_len: usize,
    pub payload: Vec<u8>,
}

impl Fragment {
    /// A complete message delivered in a single piece.
    pub fn whole(payload: Vec<u8>) -> Self {
        Self {
            offset: 0,
            total_len: payload.len(),
            payload,
        }
    }
}

/// Events surfaced by the transport to the streaming engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Link is up and ready for traffic
    Connected,
    /// Link dropped; the transport owns reconnection
    Disconnected,
    /// Text framing (JSON control/event messages)
    Fragment(Fragment),
    /// Binary framing (raw response audio)
    Binary(Vec<u8>),
}

/// Notification from the playback task back to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// The response has been fully handed to the sink
    Finished { bytes_played: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_le_bytes() {
        let frame = AudioFrame::new(0, vec![1, -1, 0x1234]);
        assert_eq!(frame.to_le_bytes(), vec![0x01, 0x00, 0xff, 0xff, 0x34, 0x12]);
    }

    #[test]
    fn test_whole_fragment() {
        let fragment = Fragment::whole(b"{}".to_vec());
        assert_eq!(fragment.offset, 0);
        assert_eq!(fragment.total_len, 2);
    }
}
