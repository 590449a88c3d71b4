//! Frame assembly from GVSP datagrams
//!
//! Tracks the single frame currently being collected. A leader datagram opens
//! a collection, payload datagrams for the same block are buffered, and the
//! matching trailer hands the buffered packets to the [`PayloadReassembler`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use gvsp_receiver_lib::frame_assembler::{FrameAssembler, ProcessResult};
//!
//! let mut assembler = FrameAssembler::from_config(&config);
//!
//! for datagram in datagrams {
//!     if let ProcessResult::Frame(frame) = assembler.process_datagram(&datagram) {
//!         sink.accept(frame)?;
//!     }
//! }
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::ReceiverConfig;
use crate::frame_validation::FrameGeometry;
use crate::gvsp_header::{self, PacketFormat, PacketHeader};
use crate::reassembly::{AssembledFrame, AssemblyError, Packet, PayloadReassembler};

/// How repeated packet ids within one frame are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicatePolicy {
    /// Keep the first payload seen for a packet id, drop later copies
    #[default]
    KeepFirst,
    /// Replace the buffered payload with the most recent copy
    KeepLast,
    /// Buffer every copy; ties are concatenated in arrival order
    KeepAll,
}

impl DuplicatePolicy {
    /// Parse from environment variable string
    pub fn from_env_str(s: &str) -> Self {
        match s.to_lowercase().replace('_', "-").as_str() {
            "keep-first" | "first" => Self::KeepFirst,
            "keep-last" | "last" => Self::KeepLast,
            "keep-all" | "all" => Self::KeepAll,
            _ => {
                log::warn!("Unknown duplicate policy '{}', defaulting to 'keep-first'", s);
                Self::KeepFirst
            }
        }
    }
}

/// Why a datagram did not advance the current frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Datagram shorter than the header
    Malformed,
    /// Camera reported an error (or sent an unknown format)
    ErrorPacket {
        /// Status code carried by the datagram
        status: u16,
    },
    /// Payload or trailer for a block other than the active one
    UnexpectedBlock {
        /// Block id of the open collection
        expected: u16,
        /// Block id carried by the datagram
        received: u16,
    },
    /// Payload or trailer while no collection is open
    NotCollecting,
    /// Repeated packet id dropped under [`DuplicatePolicy::KeepFirst`]
    Duplicate {
        /// Repeated packet id
        packet_id: u32,
    },
}

/// Result of processing a single datagram
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessResult {
    /// Leader opened a new collection
    Started,
    /// Payload buffered, frame not complete yet
    Accumulating,
    /// Trailer matched and the frame assembled successfully
    Frame(AssembledFrame),
    /// Datagram ignored, state unchanged
    Skipped(SkipReason),
    /// Trailer matched but the frame failed validation and was dropped
    Dropped(AssemblyError),
}

/// Counters describing everything the assembler has seen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblerStats {
    /// Datagrams processed
    pub datagrams: u64,
    /// Datagrams shorter than the header
    pub malformed: u64,
    /// Leaders without a complete timestamp
    pub truncated_leaders: u64,
    /// Error-format datagrams
    pub error_packets: u64,
    /// Payloads/trailers for a non-active block (or with no open collection)
    pub unexpected_block: u64,
    /// Repeated packet ids seen within a frame
    pub duplicates: u64,
    /// Collections opened by a leader
    pub frames_started: u64,
    /// Collections discarded by a newer leader or a reset
    pub frames_abandoned: u64,
    /// Frames emitted
    pub frames_completed: u64,
    /// Frames dropped on size mismatch
    pub frames_dropped: u64,
}

/// State of the frame currently being collected
#[derive(Debug, Clone)]
pub struct FrameCollection {
    block_id: u16,
    start_timestamp: Option<u64>,
    /// Arrival order, not sorted
    packets: Vec<Packet>,
    /// Packet id -> index into `packets`
    seen: HashMap<u32, usize>,
}

impl FrameCollection {
    fn new(block_id: u16, start_timestamp: Option<u64>) -> Self {
        Self {
            block_id,
            start_timestamp,
            packets: Vec::new(),
            seen: HashMap::new(),
        }
    }

    /// Block id this collection belongs to
    pub fn block_id(&self) -> u16 {
        self.block_id
    }

    /// Capture timestamp from the leader
    pub fn start_timestamp(&self) -> Option<u64> {
        self.start_timestamp
    }

    /// Buffered payload packets in arrival order
    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    /// Total buffered payload bytes
    pub fn buffered_bytes(&self) -> usize {
        self.packets.iter().map(|p| p.payload.len()).sum()
    }

    /// Insert a payload packet; returns `false` if it was discarded
    fn insert(&mut self, header: PacketHeader, payload: &[u8], policy: DuplicatePolicy) -> bool {
        match (self.seen.get(&header.packet_id).copied(), policy) {
            (None, _) | (Some(_), DuplicatePolicy::KeepAll) => {
                self.seen.insert(header.packet_id, self.packets.len());
                self.packets.push(Packet::new(header, payload));
                true
            }
            (Some(index), DuplicatePolicy::KeepLast) => {
                self.packets[index] = Packet::new(header, payload);
                true
            }
            (Some(_), DuplicatePolicy::KeepFirst) => false,
        }
    }
}

#[derive(Debug)]
enum AssemblerState {
    Idle,
    Collecting(FrameCollection),
}

/// Assembles complete frames from GVSP datagrams
///
/// At most one collection is open at any time. Every error is recovered
/// locally; the assembler always ends up `Idle` or still collecting.
#[derive(Debug)]
pub struct FrameAssembler {
    reassembler: PayloadReassembler,
    duplicate_policy: DuplicatePolicy,
    state: AssemblerState,
    stats: AssemblerStats,
}

impl FrameAssembler {
    /// Create a new frame assembler
    ///
    /// # Arguments
    /// * `geometry` - Sensor dimensions used to validate assembled frames
    /// * `duplicate_policy` - Handling of repeated packet ids within a frame
    pub fn new(geometry: FrameGeometry, duplicate_policy: DuplicatePolicy) -> Self {
        Self {
            reassembler: PayloadReassembler::new(geometry),
            duplicate_policy,
            state: AssemblerState::Idle,
            stats: AssemblerStats::default(),
        }
    }

    /// Create a frame assembler from receiver configuration
    pub fn from_config(config: &ReceiverConfig) -> Self {
        Self::new(config.geometry(), config.duplicate_policy)
    }

    /// Abandon any open collection and return to idle
    pub fn reset(&mut self) {
        if let AssemblerState::Collecting(collection) =
            std::mem::replace(&mut self.state, AssemblerState::Idle)
        {
            self.stats.frames_abandoned += 1;
            log::debug!(
                "Abandoned block {} with {} buffered packets",
                collection.block_id,
                collection.packets.len()
            );
        }
    }

    /// Whether a collection is currently open
    pub fn is_collecting(&self) -> bool {
        matches!(self.state, AssemblerState::Collecting(_))
    }

    /// The open collection, if any
    pub fn collection(&self) -> Option<&FrameCollection> {
        match &self.state {
            AssemblerState::Idle => None,
            AssemblerState::Collecting(collection) => Some(collection),
        }
    }

    /// Counters accumulated so far
    pub fn stats(&self) -> &AssemblerStats {
        &self.stats
    }

    /// Configured sensor geometry
    pub fn geometry(&self) -> FrameGeometry {
        self.reassembler.geometry()
    }

    /// Process a single raw datagram
    ///
    /// Returns `ProcessResult::Frame(frame)` when a trailer completes a frame.
    pub fn process_datagram(&mut self, datagram: &[u8]) -> ProcessResult {
        self.stats.datagrams += 1;

        let header = match gvsp_header::decode(datagram) {
            Ok(header) => header,
            Err(e) => {
                self.stats.malformed += 1;
                log::warn!("Skipping datagram: {}", e);
                return ProcessResult::Skipped(SkipReason::Malformed);
            }
        };

        match header.format {
            PacketFormat::Leader => self.handle_leader(header, datagram),
            PacketFormat::Error => {
                self.stats.error_packets += 1;
                log::warn!(
                    "Packet error: block {} packet {} status {:#06x}",
                    header.block_id,
                    header.packet_id,
                    header.status
                );
                ProcessResult::Skipped(SkipReason::ErrorPacket {
                    status: header.status,
                })
            }
            PacketFormat::Payload => self.handle_payload(header, gvsp_header::payload(datagram)),
            PacketFormat::Trailer => self.handle_trailer(header),
        }
    }

    /// Open a new collection, discarding any unfinished one
    fn handle_leader(&mut self, header: PacketHeader, datagram: &[u8]) -> ProcessResult {
        let start_timestamp = match gvsp_header::leader_timestamp(datagram) {
            Ok(timestamp) => Some(timestamp),
            Err(e) => {
                self.stats.truncated_leaders += 1;
                log::warn!("Leader for block {}: {}", header.block_id, e);
                None
            }
        };

        if let Some(previous) = self.collection() {
            log::debug!(
                "Leader for block {} abandons block {} ({} packets)",
                header.block_id,
                previous.block_id,
                previous.packets.len()
            );
            self.stats.frames_abandoned += 1;
        }

        self.stats.frames_started += 1;
        self.state =
            AssemblerState::Collecting(FrameCollection::new(header.block_id, start_timestamp));
        ProcessResult::Started
    }

    /// Buffer a payload datagram for the active block
    fn handle_payload(&mut self, header: PacketHeader, payload: &[u8]) -> ProcessResult {
        let policy = self.duplicate_policy;
        let collection = match self.active_collection_for(header.block_id) {
            Ok(collection) => collection,
            Err(reason) => return ProcessResult::Skipped(reason),
        };

        let is_duplicate = collection.seen.contains_key(&header.packet_id);
        let inserted = collection.insert(header, payload, policy);

        if is_duplicate {
            self.stats.duplicates += 1;
            log::debug!(
                "Duplicate packet {} in block {} ({:?})",
                header.packet_id,
                header.block_id,
                policy
            );
        }

        if inserted {
            ProcessResult::Accumulating
        } else {
            ProcessResult::Skipped(SkipReason::Duplicate {
                packet_id: header.packet_id,
            })
        }
    }

    /// Finalize the active block on its trailer
    fn handle_trailer(&mut self, header: PacketHeader) -> ProcessResult {
        if let Err(reason) = self.active_collection_for(header.block_id) {
            return ProcessResult::Skipped(reason);
        }

        let AssemblerState::Collecting(collection) =
            std::mem::replace(&mut self.state, AssemblerState::Idle)
        else {
            return ProcessResult::Skipped(SkipReason::NotCollecting);
        };

        match self.reassembler.assemble(
            &collection.packets,
            collection.block_id,
            collection.start_timestamp,
        ) {
            Ok(frame) => {
                self.stats.frames_completed += 1;
                ProcessResult::Frame(frame)
            }
            Err(e) => {
                self.stats.frames_dropped += 1;
                log::warn!("Dropping block {}: {}", collection.block_id, e);
                ProcessResult::Dropped(e)
            }
        }
    }

    /// The open collection if it belongs to `block_id`
    fn active_collection_for(
        &mut self,
        block_id: u16,
    ) -> std::result::Result<&mut FrameCollection, SkipReason> {
        let active = match &self.state {
            AssemblerState::Collecting(collection) => Some(collection.block_id),
            AssemblerState::Idle => None,
        };

        match active {
            Some(expected) if expected == block_id => match &mut self.state {
                AssemblerState::Collecting(collection) => Ok(collection),
                AssemblerState::Idle => Err(SkipReason::NotCollecting),
            },
            Some(expected) => {
                self.stats.unexpected_block += 1;
                log::trace!(
                    "Discarding datagram for block {} while collecting block {}",
                    block_id,
                    expected
                );
                Err(SkipReason::UnexpectedBlock {
                    expected,
                    received: block_id,
                })
            }
            None => {
                self.stats.unexpected_block += 1;
                log::trace!("Discarding datagram for block {} while idle", block_id);
                Err(SkipReason::NotCollecting)
            }
        }
    }
}
