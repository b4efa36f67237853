//! Inbound message reassembly
//!
//! Transports may split one text message into several fragments. Each
//! fragment says where its payload belongs (`offset`) and how long the whole
//! message is (`total_len`). Fragments must arrive in order and without gaps;
//! anything else discards the partial message so that a half-built message is
//! never handed to the decoder.

use crate::events::Fragment;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReassemblyError {
    #[error("Message of {total_len} bytes exceeds the {capacity}-byte reassembly buffer")]
    Oversized { total_len: usize, capacity: usize },

    #[error("Fragment at offset {offset}, expected offset {expected}")]
    OutOfOrder { offset: usize, expected: usize },

    #[error("Fragment declares total length {declared}, message in progress has {expected}")]
    LengthMismatch { declared: usize, expected: usize },

    #[error("Fragment ends at {end}, past the declared total length {total_len}")]
    Overrun { end: usize, total_len: usize },

    #[error("Abandoned a partial message at {received}/{total_len} bytes")]
    Abandoned { received: usize, total_len: usize },
}

pub type Result<T> = std::result::Result<T, ReassemblyError>;

/// Fixed-capacity accumulator for one message at a time.
pub struct Reassembler {
    buffer: Vec<u8>,
    capacity: usize,
    /// Declared length of the message in progress, if any
    total_len: Option<usize>,
}

impl Reassembler {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            capacity,
            total_len: None,
        }
    }

    /// True when no partial message is held.
    pub fn is_empty(&self) -> bool {
        self.total_len.is_none() && self.buffer.is_empty()
    }

    /// Drop any partial message.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.total_len = None;
    }

    /// Add a fragment. Returns the full message once its last byte arrives.
    ///
    /// On error the accumulator is empty afterwards, except for
    /// [`ReassemblyError::Abandoned`], where the stale partial was discarded
    /// and the new fragment already started the next message. Callers that
    /// only care about completed messages can log that one and carry on.
    pub fn push(&mut self, fragment: Fragment) -> Result<Option<Vec<u8>>> {
        let Fragment {
            offset,
            total_len,
            payload,
        } = fragment;

        let mut abandoned = None;
        if let Some(expected_total) = self.total_len {
            if offset == 0 {
                abandoned = Some(ReassemblyError::Abandoned {
                    received: self.buffer.len(),
                    total_len: expected_total,
                });
                self.clear();
            } else if total_len != expected_total {
                self.clear();
                return Err(ReassemblyError::LengthMismatch {
                    declared: total_len,
                    expected: expected_total,
                });
            } else if offset != self.buffer.len() {
                let expected = self.buffer.len();
                self.clear();
                return Err(ReassemblyError::OutOfOrder { offset, expected });
            }
        } else if offset != 0 {
            return Err(ReassemblyError::OutOfOrder {
                offset,
                expected: 0,
            });
        }

        if total_len > self.capacity {
            self.clear();
            return Err(ReassemblyError::Oversized {
                total_len,
                capacity: self.capacity,
            });
        }

        let end = offset + payload.len();
        if end > total_len {
            self.clear();
            return Err(ReassemblyError::Overrun { end, total_len });
        }

        self.total_len = Some(total_len);
        self.buffer.extend_from_slice(&payload);

        if end < total_len {
            return match abandoned {
                Some(e) => Err(e),
                None => Ok(None),
            };
        }

        let message = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.capacity));
        self.total_len = None;
        if let Some(e) = abandoned {
            // The new message completed in one piece; report the stale one
            // but still deliver it.
            warn!("{}", e);
        }
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn split(message: &[u8], cuts: &[usize]) -> Vec<Fragment> {
        let mut fragments = Vec::new();
        let mut start = 0;
        for &cut in cuts.iter().chain(std::iter::once(&message.len())) {
            fragments.push(Fragment {
                offset: start,
                total_len: message.len(),
                payload: message[start..cut].to_vec(),
            });
            start = cut;
        }
        fragments
    }

    #[test]
    fn test_single_fragment() {
        let mut reassembler = Reassembler::new(64);
        let out = reassembler.push(Fragment::whole(b"{\"event\":\"pong\"}".to_vec()));
        assert_eq!(out, Ok(Some(b"{\"event\":\"pong\"}".to_vec())));
        assert!(reassembler.is_empty());
    }

    #[test]
    fn test_random_ordered_splits_reassemble_exactly() {
        let mut rng = rand::rng();
        let mut reassembler = Reassembler::new(4096);

        for _ in 0..200 {
            let len: usize = rng.random_range(1..=4096);
            let message: Vec<u8> = (0..len).map(|_| rng.random()).collect();

            let pieces = rng.random_range(1..=len.min(8));
            let mut cuts: Vec<usize> = (0..pieces - 1).map(|_| rng.random_range(1..len)).collect();
            cuts.sort_unstable();
            cuts.dedup();

            assert!(reassembler.is_empty());
            let fragments = split(&message, &cuts);
            let last = fragments.len() - 1;
            for (i, fragment) in fragments.into_iter().enumerate() {
                let out = reassembler.push(fragment).unwrap();
                if i < last {
                    assert_eq!(out, None);
                } else {
                    assert_eq!(out.as_deref(), Some(message.as_slice()));
                }
            }
            assert!(reassembler.is_empty());
        }
    }

    #[test]
    fn test_out_of_order_discards() {
        let mut reassembler = Reassembler::new(64);
        let fragments = split(b"0123456789", &[3, 6]);

        assert_eq!(reassembler.push(fragments[0].clone()), Ok(None));
        assert_eq!(
            reassembler.push(fragments[2].clone()),
            Err(ReassemblyError::OutOfOrder {
                offset: 6,
                expected: 3
            })
        );
        assert!(reassembler.is_empty());

        // The late middle fragment has nothing to attach to
        assert!(reassembler.push(fragments[1].clone()).is_err());
        assert!(reassembler.is_empty());
    }

    #[test]
    fn test_overlap_and_inconsistent_total() {
        let mut reassembler = Reassembler::new(64);
        reassembler
            .push(Fragment {
                offset: 0,
                total_len: 10,
                payload: b"01234".to_vec(),
            })
            .unwrap();
        // Overlaps bytes 3..5
        assert!(matches!(
            reassembler.push(Fragment {
                offset: 3,
                total_len: 10,
                payload: b"3456789".to_vec(),
            }),
            Err(ReassemblyError::OutOfOrder { .. })
        ));
        assert!(reassembler.is_empty());

        reassembler
            .push(Fragment {
                offset: 0,
                total_len: 10,
                payload: b"01234".to_vec(),
            })
            .unwrap();
        assert_eq!(
            reassembler.push(Fragment {
                offset: 5,
                total_len: 12,
                payload: b"56789".to_vec(),
            }),
            Err(ReassemblyError::LengthMismatch {
                declared: 12,
                expected: 10
            })
        );
        assert!(reassembler.is_empty());
    }

    #[test]
    fn test_oversized_and_overrun() {
        let mut reassembler = Reassembler::new(8);
        assert_eq!(
            reassembler.push(Fragment {
                offset: 0,
                total_len: 9,
                payload: b"0123".to_vec(),
            }),
            Err(ReassemblyError::Oversized {
                total_len: 9,
                capacity: 8
            })
        );
        assert!(reassembler.is_empty());

        assert_eq!(
            reassembler.push(Fragment {
                offset: 0,
                total_len: 4,
                payload: b"012345".to_vec(),
            }),
            Err(ReassemblyError::Overrun {
                end: 6,
                total_len: 4
            })
        );
        assert!(reassembler.is_empty());
    }

    #[test]
    fn test_new_message_abandons_partial() {
        let mut reassembler = Reassembler::new(64);
        reassembler
            .push(Fragment {
                offset: 0,
                total_len: 10,
                payload: b"stale".to_vec(),
            })
            .unwrap();

        // New message in two parts: the first reports the abandoned partial
        assert_eq!(
            reassembler.push(Fragment {
                offset: 0,
                total_len: 6,
                payload: b"fre".to_vec(),
            }),
            Err(ReassemblyError::Abandoned {
                received: 5,
                total_len: 10
            })
        );
        assert!(!reassembler.is_empty());
        assert_eq!(
            reassembler.push(Fragment {
                offset: 3,
                total_len: 6,
                payload: b"esh".to_vec(),
            }),
            Ok(Some(b"freesh".to_vec()))
        );
    }

    #[test]
    fn test_clear() {
        let mut reassembler = Reassembler::new(64);
        reassembler
            .push(Fragment {
                offset: 0,
                total_len: 10,
                payload: b"half".to_vec(),
            })
            .unwrap();
        assert!(!reassembler.is_empty());
        reassembler.clear();
        assert!(reassembler.is_empty());
    }
}
