//! Chunk manager: split a file's ciphertext into numbered packets, track received packets,
//! reassemble in packet order.

use std::collections::{BTreeMap, BTreeSet};

use crate::protocol::FilePacket;

/// Default largest ciphertext slice carried by one packet.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 64 * 1024; // 64 KiB

/// Number of packets needed for `ciphertext_len` bytes.
pub fn packet_count(ciphertext_len: u64, max_packet_size: usize) -> Result<u16, ChunkError> {
    if max_packet_size == 0 {
        return Err(ChunkError::ZeroPacketSize);
    }
    let count = ciphertext_len.div_ceil(max_packet_size as u64).max(1);
    u16::try_from(count).map_err(|_| ChunkError::TooManyPackets(count))
}

/// Numbering for a file sent packet by packet, without holding the whole ciphertext.
#[derive(Debug, Clone)]
pub struct PacketPlan {
    filename: String,
    original_size: u32,
    total_packets: u16,
    next: u16,
}

impl PacketPlan {
    pub fn new(
        filename: &str,
        original_size: u64,
        ciphertext_len: u64,
        max_packet_size: usize,
    ) -> Result<Self, ChunkError> {
        let original_size =
            u32::try_from(original_size).map_err(|_| ChunkError::FileTooLarge(original_size))?;
        Ok(Self {
            filename: filename.to_string(),
            original_size,
            total_packets: packet_count(ciphertext_len, max_packet_size)?,
            next: 1,
        })
    }

    pub fn total_packets(&self) -> u16 {
        self.total_packets
    }

    /// Wrap the next slice of ciphertext. Returns `None` once every packet is issued.
    pub fn next_packet(&mut self, content: Vec<u8>) -> Option<FilePacket> {
        if self.next > self.total_packets {
            return None;
        }
        let packet = FilePacket {
            content_size: content.len() as u32,
            original_size: self.original_size,
            packet_number: self.next,
            total_packets: self.total_packets,
            filename: self.filename.clone(),
            content,
        };
        self.next += 1;
        Some(packet)
    }

    pub fn is_done(&self) -> bool {
        self.next > self.total_packets
    }
}

/// Split a whole ciphertext into packets of at most `max_packet_size` bytes.
pub fn split(
    ciphertext: &[u8],
    max_packet_size: usize,
    filename: &str,
    original_size: u64,
) -> Result<Vec<FilePacket>, ChunkError> {
    let mut plan = PacketPlan::new(
        filename,
        original_size,
        ciphertext.len() as u64,
        max_packet_size,
    )?;
    let mut out = Vec::with_capacity(plan.total_packets() as usize);
    if ciphertext.is_empty() {
        out.extend(plan.next_packet(Vec::new()));
        return Ok(out);
    }
    for slice in ciphertext.chunks(max_packet_size) {
        out.extend(plan.next_packet(slice.to_vec()));
    }
    Ok(out)
}

/// Result of feeding one packet into a transfer.
#[derive(Debug, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// Stored; more packets outstanding.
    InProgress,
    /// Packet number already seen; nothing stored.
    DuplicateIgnored,
    /// Every packet present.
    Complete(Reassembled),
}

/// A complete file's ciphertext, kept as the received chunks in packet order so the
/// receiver can decrypt one chunk at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembled {
    chunks: Vec<Vec<u8>>,
}

impl Reassembled {
    /// Total ciphertext bytes.
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(Vec::is_empty)
    }

    pub fn into_chunks(self) -> std::vec::IntoIter<Vec<u8>> {
        self.chunks.into_iter()
    }

    /// The whole ciphertext in one buffer.
    pub fn concat(&self) -> Vec<u8> {
        self.chunks.concat()
    }
}

/// Receive-side state for one file.
#[derive(Debug)]
pub struct TransferState {
    filename: String,
    original_size: u32,
    total_packets: u16,
    max_packet_size: usize,
    received: BTreeSet<u16>,
    chunks: BTreeMap<u16, Vec<u8>>,
    accumulated: usize,
}

impl TransferState {
    /// Open a transfer from its first arriving packet (any packet number). The packet
    /// itself still has to be passed to [`TransferState::accept`].
    pub fn open(
        first: &FilePacket,
        max_packet_size: usize,
        max_total_packets: u16,
    ) -> Result<Self, ChunkError> {
        if max_packet_size == 0 {
            return Err(ChunkError::ZeroPacketSize);
        }
        if first.total_packets == 0 || first.total_packets > max_total_packets {
            return Err(ChunkError::TooManyPackets(first.total_packets as u64));
        }
        if first.filename.is_empty() {
            return Err(ChunkError::InconsistentPacket("empty filename"));
        }
        Ok(Self {
            filename: first.filename.clone(),
            original_size: first.original_size,
            total_packets: first.total_packets,
            max_packet_size,
            received: BTreeSet::new(),
            chunks: BTreeMap::new(),
            accumulated: 0,
        })
    }

    /// Feed one packet. Out-of-order arrival is fine; a repeated packet number is ignored.
    pub fn accept(&mut self, packet: FilePacket) -> Result<AcceptOutcome, ChunkError> {
        if packet.packet_number == 0 || packet.packet_number > self.total_packets {
            return Err(ChunkError::InvalidPacketNumber {
                number: packet.packet_number,
                total: self.total_packets,
            });
        }
        if packet.total_packets != self.total_packets {
            return Err(ChunkError::InconsistentPacket("total_packets changed"));
        }
        if packet.original_size != self.original_size {
            return Err(ChunkError::InconsistentPacket("original_size changed"));
        }
        if packet.filename != self.filename {
            return Err(ChunkError::InconsistentPacket("filename changed"));
        }
        if self.received.contains(&packet.packet_number) {
            return Ok(AcceptOutcome::DuplicateIgnored);
        }
        let declared = packet.content_size as usize;
        if declared != packet.content.len() {
            return Err(ChunkError::SizeMismatch {
                declared: packet.content_size as u64,
                actual: packet.content.len() as u64,
            });
        }
        if declared > self.max_packet_size || self.accumulated + declared > self.capacity() {
            return Err(ChunkError::TransferOverflow {
                declared: packet.content_size as u64,
                capacity: self.capacity() as u64,
            });
        }
        self.accumulated += declared;
        self.received.insert(packet.packet_number);
        self.chunks.insert(packet.packet_number, packet.content);
        if self.is_complete() {
            Ok(AcceptOutcome::Complete(self.reassemble()))
        } else {
            Ok(AcceptOutcome::InProgress)
        }
    }

    pub fn is_complete(&self) -> bool {
        self.received.len() == self.total_packets as usize
    }

    /// Upper bound on buffered ciphertext: `total_packets × max_packet_size`.
    pub fn capacity(&self) -> usize {
        self.total_packets as usize * self.max_packet_size
    }

    /// Ciphertext bytes currently buffered.
    pub fn accumulated_bytes(&self) -> usize {
        self.chunks.values().map(Vec::len).sum()
    }

    pub fn received_count(&self) -> usize {
        self.received.len()
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn original_size(&self) -> u32 {
        self.original_size
    }

    pub fn total_packets(&self) -> u16 {
        self.total_packets
    }

    // Drains the buffer; received numbers stay recorded so late duplicates are still ignored.
    fn reassemble(&mut self) -> Reassembled {
        Reassembled {
            chunks: std::mem::take(&mut self.chunks).into_values().collect(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("packet size must be non-zero")]
    ZeroPacketSize,
    #[error("too many packets: {0}")]
    TooManyPackets(u64),
    #[error("file too large: {0} bytes")]
    FileTooLarge(u64),
    #[error("packet number {number} outside 1..={total}")]
    InvalidPacketNumber { number: u16, total: u16 },
    #[error("inconsistent packet: {0}")]
    InconsistentPacket(&'static str),
    #[error("content size mismatch: declared {declared}, actual {actual}")]
    SizeMismatch { declared: u64, actual: u64 },
    #[error("transfer overflow: packet of {declared} bytes exceeds capacity {capacity}")]
    TransferOverflow { declared: u64, capacity: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn open_for(packets: &[FilePacket], max: usize) -> TransferState {
        TransferState::open(&packets[0], max, u16::MAX).unwrap()
    }

    #[test]
    fn split_counts() {
        let packets = split(&sample(100), 30, "f", 90).unwrap();
        assert_eq!(packets.len(), 4);
        assert_eq!(packets[0].packet_number, 1);
        assert_eq!(packets[3].content.len(), 10);
        assert!(packets.iter().all(|p| p.total_packets == 4 && p.original_size == 90));
        assert_eq!(split(&sample(90), 30, "f", 80).unwrap().len(), 3);
        assert_eq!(split(&sample(10), 100, "f", 1).unwrap().len(), 1);
    }

    #[test]
    fn split_rejects_zero_size_and_huge_files() {
        assert_eq!(split(&sample(10), 0, "f", 1), Err(ChunkError::ZeroPacketSize));
        assert_eq!(
            packet_count(u16::MAX as u64 * 2 + 1, 2),
            Err(ChunkError::TooManyPackets(u16::MAX as u64 + 1))
        );
        assert!(matches!(
            PacketPlan::new("f", u32::MAX as u64 + 1, 10, 10),
            Err(ChunkError::FileTooLarge(_))
        ));
    }

    #[test]
    fn plan_stops_after_last_packet() {
        let mut plan = PacketPlan::new("f", 20, 48, 16).unwrap();
        assert_eq!(plan.total_packets(), 3);
        for n in 1..=3 {
            assert_eq!(plan.next_packet(vec![0; 16]).unwrap().packet_number, n);
        }
        assert!(plan.is_done());
        assert!(plan.next_packet(vec![0; 16]).is_none());
    }

    #[test]
    fn reassembles_in_order() {
        let data = sample(100);
        let packets = split(&data, 30, "f", 90).unwrap();
        let mut state = open_for(&packets, 30);
        let n = packets.len();
        for (i, p) in packets.into_iter().enumerate() {
            match state.accept(p).unwrap() {
                AcceptOutcome::Complete(file) => {
                    assert_eq!(i, n - 1);
                    assert_eq!(file.len(), data.len());
                    assert_eq!(file.concat(), data);
                    assert_eq!(file.into_chunks().count(), n);
                }
                AcceptOutcome::InProgress => assert!(i < n - 1),
                AcceptOutcome::DuplicateIgnored => panic!("unexpected duplicate"),
            }
        }
    }

    #[test]
    fn duplicate_packet_two_before_one() {
        let data = sample(90);
        let packets = split(&data, 30, "f", 70).unwrap();
        let mut state = open_for(&packets, 30);
        assert_eq!(state.accept(packets[1].clone()).unwrap(), AcceptOutcome::InProgress);
        assert_eq!(
            state.accept(packets[1].clone()).unwrap(),
            AcceptOutcome::DuplicateIgnored
        );
        assert_eq!(state.accept(packets[0].clone()).unwrap(), AcceptOutcome::InProgress);
        assert_eq!(state.accumulated_bytes(), 60);
        match state.accept(packets[2].clone()).unwrap() {
            AcceptOutcome::Complete(file) => assert_eq!(file.concat(), data),
            other => panic!("expected completion, got {other:?}"),
        }
        // Late duplicates after completion are still absorbed.
        assert_eq!(
            state.accept(packets[0].clone()).unwrap(),
            AcceptOutcome::DuplicateIgnored
        );
    }

    #[test]
    fn oversized_packet_is_overflow() {
        let packets = split(&sample(60), 30, "f", 50).unwrap();
        let mut state = open_for(&packets, 30);
        let mut big = packets[0].clone();
        big.content = sample(31);
        big.content_size = 31;
        assert!(matches!(
            state.accept(big),
            Err(ChunkError::TransferOverflow { declared: 31, capacity: 60 })
        ));
        assert_eq!(state.accumulated_bytes(), 0);
    }

    #[test]
    fn declared_size_must_match_content() {
        let packets = split(&sample(60), 30, "f", 50).unwrap();
        let mut state = open_for(&packets, 30);
        let mut lying = packets[0].clone();
        lying.content_size = 10;
        assert_eq!(
            state.accept(lying),
            Err(ChunkError::SizeMismatch { declared: 10, actual: 30 })
        );
    }

    #[test]
    fn rejects_inconsistent_packets() {
        let packets = split(&sample(60), 30, "f", 50).unwrap();
        let mut state = open_for(&packets, 30);

        let mut zero = packets[0].clone();
        zero.packet_number = 0;
        assert!(matches!(state.accept(zero), Err(ChunkError::InvalidPacketNumber { .. })));

        let mut past_end = packets[0].clone();
        past_end.packet_number = 3;
        assert!(matches!(state.accept(past_end), Err(ChunkError::InvalidPacketNumber { .. })));

        let mut renamed = packets[1].clone();
        renamed.filename = "g".into();
        assert!(matches!(state.accept(renamed), Err(ChunkError::InconsistentPacket(_))));

        let mut resized = packets[1].clone();
        resized.original_size = 1;
        assert!(matches!(state.accept(resized), Err(ChunkError::InconsistentPacket(_))));
    }

    #[test]
    fn open_enforces_packet_limit() {
        let packets = split(&sample(100), 10, "f", 90).unwrap();
        assert_eq!(
            TransferState::open(&packets[0], 10, 5).unwrap_err(),
            ChunkError::TooManyPackets(10)
        );
    }

    proptest! {
        #[test]
        fn any_permutation_with_duplicates_reassembles(
            data in prop::collection::vec(any::<u8>(), 1..2000),
            max in 1usize..300,
            seed in any::<u64>(),
            dup_mask in prop::collection::vec(any::<bool>(), 0..64),
        ) {
            let packets = split(&data, max, "file.bin", data.len() as u64).unwrap();
            let mut order: Vec<usize> = (0..packets.len()).collect();
            // Deterministic shuffle from the seed.
            let mut s = seed | 1;
            for i in (1..order.len()).rev() {
                s ^= s << 13; s ^= s >> 7; s ^= s << 17;
                order.swap(i, (s % (i as u64 + 1)) as usize);
            }
            let mut feed = Vec::new();
            for (k, &i) in order.iter().enumerate() {
                feed.push(i);
                if dup_mask.get(k).copied().unwrap_or(false) {
                    feed.push(i);
                }
            }
            let mut state = TransferState::open(&packets[0], max, u16::MAX).unwrap();
            let mut completed = None;
            for i in feed {
                match state.accept(packets[i].clone()).unwrap() {
                    AcceptOutcome::Complete(file) => {
                        prop_assert!(completed.is_none());
                        completed = Some(file.concat());
                    }
                    AcceptOutcome::InProgress | AcceptOutcome::DuplicateIgnored => {}
                }
                prop_assert!(state.accumulated_bytes() <= state.capacity());
            }
            prop_assert_eq!(completed, Some(data));
        }

        #[test]
        fn declared_sizes_never_exceed_bound(
            total in 1u16..8,
            max in 1usize..64,
            claims in prop::collection::vec((1u16..10, 0usize..200), 1..40),
        ) {
            let first = FilePacket {
                content_size: 0,
                original_size: 0,
                packet_number: 1,
                total_packets: total,
                filename: "x".into(),
                content: Vec::new(),
            };
            let mut state = TransferState::open(&first, max, u16::MAX).unwrap();
            for (number, len) in claims {
                let packet = FilePacket {
                    content_size: len as u32,
                    original_size: 0,
                    packet_number: number,
                    total_packets: total,
                    filename: "x".into(),
                    content: vec![0u8; len],
                };
                let before = state.accumulated_bytes();
                let was_new = !state.received.contains(&number);
                match state.accept(packet) {
                    Err(ChunkError::TransferOverflow { .. }) => {
                        prop_assert!(len > max);
                        prop_assert_eq!(state.accumulated_bytes(), before);
                    }
                    Ok(AcceptOutcome::DuplicateIgnored) => prop_assert!(!was_new),
                    _ => {}
                }
                prop_assert!(state.accumulated_bytes() <= total as usize * max);
            }
        }
    }
}
