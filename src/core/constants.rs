//! Protocol constants.
//!
//! Wire-visible values are fixed by the protocol and MUST NOT be changed
//! without bumping [`PROTOCOL_VERSION`].

// =============================================================================
// PROTOCOL VERSIONS
// =============================================================================

/// Current protocol version.
pub const PROTOCOL_VERSION: i32 = 71;

/// Legacy protocol version. Peers speaking it get XOR obfuscation and no
/// netchan checksum.
pub const LEGACY_PROTOCOL_VERSION: i32 = 68;

// =============================================================================
// TRANSPORT (netchan)
// =============================================================================

/// Largest datagram the transport will emit.
pub const MAX_PACKET_LEN: usize = 1400;

/// Largest reassembled message.
pub const MAX_MSG_LEN: usize = 16384;

/// Payload bytes carried by a full fragment. A shorter fragment ends a
/// message.
pub const FRAGMENT_SIZE: usize = MAX_PACKET_LEN - 100;

/// Sequence bit marking a fragmented packet.
pub const FRAGMENT_BIT: u32 = 1 << 31;

/// Sequence value marking an out-of-band (connectionless) packet.
pub const OOB_SEQUENCE: u32 = 0xFFFF_FFFF;

/// UDP + IPv4 header overhead charged against the byte rate.
pub const UDP_IP_HEADER_SIZE: usize = 28;

/// UDP + IPv6 header overhead charged against the byte rate.
pub const UDP_IP6_HEADER_SIZE: usize = 48;

/// Host-side XOR obfuscation starts after the reliable acknowledge.
pub const HOST_ENCODE_START: usize = 4;

/// User-side XOR obfuscation starts after host id, message ack, reliable ack.
pub const USER_ENCODE_START: usize = 12;

// =============================================================================
// RELIABLE COMMANDS
// =============================================================================

/// Ring capacity of the reliable command channel. Must be a power of two.
pub const MAX_RELIABLE_COMMANDS: usize = 64;

/// Longest single command or broadcast-state string.
pub const MAX_STRING_CHARS: usize = 1024;

/// Longest string carried in a gamestate entry.
pub const BIG_INFO_STRING: usize = 8192;

/// Longest userinfo string.
pub const MAX_INFO_STRING: usize = 1024;

// =============================================================================
// SNAPSHOTS
// =============================================================================

/// Frames remembered per participant for delta references. Power of two.
pub const PACKET_BACKUP: usize = 32;

/// Mask for indexing the per-participant frame ring.
pub const PACKET_MASK: usize = PACKET_BACKUP - 1;

/// Entity id space size.
pub const MAX_ENTITIES: usize = 1024;

/// Participant slots. Slot ids travel in one byte and double as entity ids.
pub const MAX_PARTICIPANTS: usize = 256;

/// Entity id terminating an entity list on the wire.
pub const ENTITY_SENTINEL: u16 = (MAX_ENTITIES - 1) as u16;

/// Visible entities per snapshot. Excess is silently dropped.
pub const MAX_SNAPSHOT_ENTITIES: usize = 256;

/// Common (shared) frames retained by snapshot storage.
pub const NUM_SNAPSHOT_FRAMES: usize = PACKET_BACKUP * 4;

/// Default snapshot storage arena size in entity records.
pub const DEFAULT_SNAPSHOT_ENTITIES: usize = PACKET_BACKUP * MAX_ENTITIES;

/// Bytes of region-connectivity mask carried per snapshot.
pub const MAX_AREA_BYTES: usize = 32;

/// Offset subtracted from the outgoing sequence beyond which a delta
/// reference is considered too old.
pub const DELTA_WINDOW_SLACK: i32 = 3;

/// Broadcast-state slots.
pub const MAX_CONFIGSTRINGS: usize = 1024;

/// Broadcast-state slot carrying host-wide system info (host id).
pub const CS_SYSTEM_INFO: usize = 1;

/// Values at or above this length are chunked into `bcs0/bcs1/bcs2`.
pub const CONFIGSTRING_CHUNK_THRESHOLD: usize = MAX_STRING_CHARS - 24;

/// Snapshot flag: previous snapshot was skipped by rate control.
pub const SNAPFLAG_RATE_DELAYED: u8 = 1;

/// Snapshot flag: participant has not entered the world yet.
pub const SNAPFLAG_NOT_ACTIVE: u8 = 2;

// =============================================================================
// DOWNLOAD
// =============================================================================

/// Blocks in flight per download.
pub const MAX_DOWNLOAD_WINDOW: usize = 8;

/// Bytes per download block.
pub const MAX_DOWNLOAD_BLKSIZE: usize = 2048;

/// Largest file served. Block indices, the end-of-file block included,
/// travel in two bytes.
pub const MAX_DOWNLOAD_SIZE: u64 = u16::MAX as u64 * MAX_DOWNLOAD_BLKSIZE as u64;

/// Resend the window from the last acknowledged block after this long.
pub const DOWNLOAD_RETRANSMIT_MS: u64 = 1000;

// =============================================================================
// ADMISSION
// =============================================================================

/// Challenge time bucket: `time_ms >> CHALLENGE_TIME_SHIFT` (~16 s).
pub const CHALLENGE_TIME_SHIFT: u32 = 14;

/// Per-address burst for `getchallenge` and `connect`.
pub const ADDRESS_RATE_BURST: u32 = 10;

/// Per-address period in milliseconds.
pub const ADDRESS_RATE_PERIOD_MS: u64 = 1000;

/// Global burst for rejection notices.
pub const GLOBAL_RATE_BURST: u32 = 10;

/// Global period in milliseconds.
pub const GLOBAL_RATE_PERIOD_MS: u64 = 200;

/// Address buckets kept before stale ones are pruned.
pub const MAX_RATE_BUCKETS: usize = 16384;

// =============================================================================
// FLOOD CONTROL (reliable commands from participants)
// =============================================================================

/// General command flood limit: burst.
pub const FLOOD_BURST: u32 = 8;

/// General command flood limit: period in milliseconds.
pub const FLOOD_PERIOD_MS: u64 = 500;

/// `userinfo` flood limit: burst.
pub const USERINFO_BURST: u32 = 5;

/// `userinfo` flood limit: period in milliseconds.
pub const USERINFO_PERIOD_MS: u64 = 1000;

/// Full-state resend limit: burst.
pub const GAMESTATE_BURST: u32 = 4;

/// Full-state resend limit: period in milliseconds.
pub const GAMESTATE_PERIOD_MS: u64 = 1000;
