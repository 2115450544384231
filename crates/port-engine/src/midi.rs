//! Per-cycle MIDI event buffers.

use smallvec::SmallVec;

use crate::error::MidiError;

/// Largest raw message a port buffer accepts.
pub const MAX_MIDI_EVENT_SIZE: usize = 256;

/// Raw MIDI message tagged with a cycle-relative frame offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiEvent {
    timestamp: u32,
    data: SmallVec<[u8; 3]>,
}

impl MidiEvent {
    pub fn new(timestamp: u32, bytes: &[u8]) -> Result<Self, MidiError> {
        if bytes.is_empty() {
            return Err(MidiError::Empty);
        }
        if bytes.len() > MAX_MIDI_EVENT_SIZE {
            return Err(MidiError::Oversized(bytes.len()));
        }
        Ok(Self {
            timestamp,
            data: SmallVec::from_slice(bytes),
        })
    }

    #[inline]
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Ordered list of MIDI events exchanged during one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MidiBuffer {
    events: Vec<MidiEvent>,
}

impl MidiBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
        }
    }

    /// Appends an event. Events must arrive in non-decreasing timestamp order.
    pub fn push(&mut self, timestamp: u32, bytes: &[u8]) -> Result<(), MidiError> {
        if let Some(last) = self.events.last() {
            if last.timestamp > timestamp {
                return Err(MidiError::TooLate {
                    timestamp,
                    last: last.timestamp,
                });
            }
        }
        self.events.push(MidiEvent::new(timestamp, bytes)?);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&MidiEvent> {
        self.events.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MidiEvent> {
        self.events.iter()
    }

    /// Appends all events of `other` without ordering checks. Call
    /// [`MidiBuffer::sort`] once every source has been merged.
    pub(crate) fn extend_from(&mut self, other: &MidiBuffer) {
        self.events.extend(other.events.iter().cloned());
    }

    /// Stable sort by timestamp; equal timestamps keep their merge order.
    pub(crate) fn sort(&mut self) {
        self.events.sort_by_key(MidiEvent::timestamp);
    }
}

impl<'a> IntoIterator for &'a MidiBuffer {
    type Item = &'a MidiEvent;
    type IntoIter = std::slice::Iter<'a, MidiEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_order_events() {
        let mut buffer = MidiBuffer::new();
        buffer.push(10, &[0x90, 60, 100]).unwrap();
        assert_eq!(
            buffer.push(4, &[0x80, 60, 0]),
            Err(MidiError::TooLate {
                timestamp: 4,
                last: 10
            })
        );
        buffer.push(10, &[0x80, 60, 0]).unwrap();
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn rejects_oversized_and_empty_events() {
        let mut buffer = MidiBuffer::new();
        let sysex = vec![0xF0; MAX_MIDI_EVENT_SIZE + 1];
        assert_eq!(
            buffer.push(0, &sysex),
            Err(MidiError::Oversized(MAX_MIDI_EVENT_SIZE + 1))
        );
        assert_eq!(buffer.push(0, &[]), Err(MidiError::Empty));
        assert!(buffer.is_empty());
    }

    #[test]
    fn sort_keeps_merge_order_for_ties() {
        let mut merged = MidiBuffer::new();
        let mut a = MidiBuffer::new();
        a.push(5, &[0xB0, 1, 1]).unwrap();
        let mut b = MidiBuffer::new();
        b.push(1, &[0xB0, 2, 2]).unwrap();
        b.push(5, &[0xB0, 3, 3]).unwrap();
        merged.extend_from(&a);
        merged.extend_from(&b);
        merged.sort();
        let order: Vec<u8> = merged.iter().map(|event| event.data()[1]).collect();
        assert_eq!(order, vec![2, 1, 3]);
    }
}
