use crate::transport::MAX_PACKET_SIZE;

/// Fixed-capacity packet store indexed by RTP sequence number.
///
/// Packet `seq` lives in slot `seq % capacity`, tagged with its sequence
/// number, so a lookup reads a single slot and a newer packet silently
/// replaces the one `capacity` sequence numbers before it.
#[derive(Debug)]
pub struct ReceiveRing {
    data: Vec<u8>,
    slots: Vec<Slot>,
    slot_size: usize,
    overflows: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    seq: Option<u16>,
    len: usize,
    consumed: bool,
}

/// Result of [`ReceiveRing::store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stored {
    /// The slot was free or held an already consumed packet.
    Fresh,
    /// An unread packet was overwritten.
    Overwrote(u16),
}

impl ReceiveRing {
    pub fn new(capacity: usize) -> Self {
        Self::with_slot_size(capacity, MAX_PACKET_SIZE)
    }

    pub fn with_slot_size(capacity: usize, slot_size: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            data: vec![0u8; capacity * slot_size],
            slots: vec![Slot::default(); capacity],
            slot_size,
            overflows: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Unread packets lost to overwrites so far.
    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    fn index(&self, seq: u16) -> usize {
        usize::from(seq) % self.slots.len()
    }

    /// Store `packet` under `seq`, truncated to the slot size.
    pub fn store(&mut self, seq: u16, packet: &[u8]) -> Stored {
        let i = self.index(seq);
        let len = packet.len().min(self.slot_size);
        let at = i * self.slot_size;
        self.data[at..at + len].copy_from_slice(&packet[..len]);

        let slot = &mut self.slots[i];
        let stored = match slot.seq {
            Some(old) if old != seq && !slot.consumed => {
                self.overflows += 1;
                Stored::Overwrote(old)
            }
            _ => Stored::Fresh,
        };
        *slot = Slot {
            seq: Some(seq),
            len,
            consumed: false,
        };
        stored
    }

    pub fn contains(&self, seq: u16) -> bool {
        self.slots[self.index(seq)].seq == Some(seq)
    }

    /// Packet stored under `seq`, if it has not been overwritten.
    pub fn get(&self, seq: u16) -> Option<&[u8]> {
        let i = self.index(seq);
        let slot = &self.slots[i];
        (slot.seq == Some(seq)).then(|| &self.data[i * self.slot_size..i * self.slot_size + slot.len])
    }

    /// Copy the packet stored under `seq` into `out` and mark it consumed.
    /// Returns `None` when it is missing or does not fit.
    pub fn take(&mut self, seq: u16, out: &mut [u8]) -> Option<usize> {
        let packet = self.get(seq)?;
        let len = packet.len();
        out.get_mut(..len)?.copy_from_slice(packet);
        let i = self.index(seq);
        self.slots[i].consumed = true;
        Some(len)
    }

    pub fn clear(&mut self) {
        self.slots.fill(Slot::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_sequence() {
        let mut ring = ReceiveRing::with_slot_size(4, 8);
        ring.store(10, b"ten");
        ring.store(11, b"eleven");
        assert_eq!(ring.get(10), Some(&b"ten"[..]));
        assert_eq!(ring.get(11), Some(&b"eleven"[..]));
        assert_eq!(ring.get(12), None);
    }

    #[test]
    fn newer_packet_replaces_older() {
        let mut ring = ReceiveRing::with_slot_size(4, 8);
        assert_eq!(ring.store(1, b"a"), Stored::Fresh);
        assert_eq!(ring.store(5, b"b"), Stored::Overwrote(1));
        assert!(!ring.contains(1));
        assert_eq!(ring.get(5), Some(&b"b"[..]));
        assert_eq!(ring.overflows(), 1);
    }

    #[test]
    fn consumed_packets_are_not_overflow() {
        let mut ring = ReceiveRing::with_slot_size(2, 8);
        ring.store(0, b"x");
        let mut out = [0u8; 8];
        assert_eq!(ring.take(0, &mut out), Some(1));
        assert_eq!(ring.store(2, b"y"), Stored::Fresh);
        assert_eq!(ring.overflows(), 0);
    }

    #[test]
    fn oversized_packets_are_truncated() {
        let mut ring = ReceiveRing::with_slot_size(2, 4);
        ring.store(3, b"abcdef");
        assert_eq!(ring.get(3), Some(&b"abcd"[..]));
    }

    #[test]
    fn sequence_wrap() {
        let mut ring = ReceiveRing::with_slot_size(16384, 4);
        ring.store(u16::MAX, b"end");
        ring.store(0, b"beg");
        assert_eq!(ring.get(u16::MAX), Some(&b"end"[..]));
        assert_eq!(ring.get(0), Some(&b"beg"[..]));
    }

    #[test]
    fn take_into_short_buffer_fails() {
        let mut ring = ReceiveRing::with_slot_size(2, 8);
        ring.store(1, b"abcdef");
        let mut out = [0u8; 3];
        assert_eq!(ring.take(1, &mut out), None);
        ring.clear();
        assert!(!ring.contains(1));
    }
}
