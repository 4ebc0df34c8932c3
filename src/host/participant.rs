//! Per-participant connection record.
//!
//! Handles per-participant state including:
//! - Connection lifecycle (`Free → Connected → Primed → Active`, `Zombie`)
//! - Reliable command rings in both directions
//! - Frame history for delta references
//! - Pacing, flood buckets and download state

use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;

use super::download::Download;
use crate::admission::{LeakyBucket, UserInfo};
use crate::core::MAX_CONFIGSTRINGS;
use crate::snapshot::FrameRing;
use crate::sync::{InboundCommands, ReliableRing, UserCmd};
use crate::transport::TransportQueue;

/// Connection state of a slot.
///
/// Ordered so `state >= Connected` means "owns a live connection".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParticipantState {
    /// Unowned.
    #[default]
    Free,
    /// Dropped; the slot lingers so the disconnect notice can go out.
    Zombie,
    /// Admitted, no gamestate sent yet.
    Connected,
    /// Gamestate sent, waiting for the first move.
    Primed,
    /// In the world.
    Active,
}

impl fmt::Display for ParticipantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Free => "free",
            Self::Zombie => "zombie",
            Self::Connected => "connected",
            Self::Primed => "primed",
            Self::Active => "active",
        };
        f.write_str(name)
    }
}

/// What is on the other end of a slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PeerKind {
    /// A network peer.
    #[default]
    Remote,
    /// A peer on the loopback interface: unpaced, exempt from challenges.
    Loopback,
    /// Host-driven; no network peer at all.
    Bot,
}

/// Why a participant was dropped. The text is broadcast and sent in the
/// final `disconnect` command.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// The participant asked to leave.
    #[error("disconnected")]
    Disconnected,

    /// Nothing heard for too long.
    #[error("timed out")]
    TimedOut,

    /// A reliable command sequence was skipped.
    #[error("Lost reliable commands")]
    LostCommands,

    /// Too many unacknowledged reliable commands.
    #[error("Host command overflow")]
    CommandOverflow,

    /// The gamestate did not fit in one message.
    #[error("gamestate overflow")]
    GamestateOverflow,

    /// Asset checksums failed verification.
    #[error("Unpure user detected. Invalid .PK3 files referenced!")]
    UnpureUser,

    /// Moved into the world without a valid asset acknowledgment.
    #[error("Cannot validate pure user!")]
    CannotValidate,

    /// Acknowledged a download block that was never sent.
    #[error("broken download")]
    BrokenDownload,

    /// Userinfo update too long.
    #[error("userinfo string length exceeded")]
    UserinfoTooLong,

    /// Slot taken over for a local connection.
    #[error("only bots on host")]
    Evicted,

    /// Removed by the host.
    #[error("was kicked")]
    Kicked,

    /// Host shutting down or restarting.
    #[error("{0}")]
    Host(String),
}

/// One slot of the connection table.
#[derive(Debug)]
pub struct Participant {
    pub(crate) id: usize,
    pub(crate) state: ParticipantState,
    pub(crate) kind: PeerKind,
    pub(crate) address: Option<SocketAddr>,
    pub(crate) transport: Option<TransportQueue>,
    pub(crate) challenge: i32,

    pub(crate) name: String,
    pub(crate) userinfo: UserInfo,

    /// Host → participant.
    pub(crate) reliable: ReliableRing,
    /// Participant → host.
    pub(crate) inbound: InboundCommands,

    pub(crate) frames: FrameRing,
    pub(crate) delta_message: Option<i32>,
    pub(crate) message_acknowledge: i32,
    pub(crate) gamestate_message: i32,
    pub(crate) last_usercmd: UserCmd,

    pub(crate) snapshot_msec: u64,
    pub(crate) last_snapshot_time: Option<u64>,
    pub(crate) rate_delayed: bool,

    pub(crate) last_packet_time: u64,
    pub(crate) last_connect_time: u64,
    pub(crate) last_disconnect_time: u64,
    pub(crate) just_connected: bool,

    pub(crate) cs_updated: Vec<bool>,

    pub(crate) download: Option<Download>,
    /// Outgoing sequence when the last download finished.
    pub(crate) download_done_message: Option<i32>,

    pub(crate) got_asset_ack: bool,
    pub(crate) asset_authentic: bool,

    pub(crate) cmd_bucket: LeakyBucket,
    pub(crate) info_bucket: LeakyBucket,
    pub(crate) gamestate_bucket: LeakyBucket,
}

impl Participant {
    /// A free slot.
    pub fn new(id: usize) -> Self {
        Self {
            id,
            state: ParticipantState::Free,
            kind: PeerKind::Remote,
            address: None,
            transport: None,
            challenge: 0,
            name: String::new(),
            userinfo: UserInfo::new(),
            reliable: ReliableRing::new(),
            inbound: InboundCommands::new(),
            frames: FrameRing::new(),
            delta_message: None,
            message_acknowledge: 0,
            gamestate_message: 0,
            last_usercmd: UserCmd::default(),
            snapshot_msec: 50,
            last_snapshot_time: None,
            rate_delayed: false,
            last_packet_time: 0,
            last_connect_time: 0,
            last_disconnect_time: 0,
            just_connected: false,
            cs_updated: vec![false; MAX_CONFIGSTRINGS],
            download: None,
            download_done_message: None,
            got_asset_ack: false,
            asset_authentic: false,
            cmd_bucket: LeakyBucket::new(),
            info_bucket: LeakyBucket::new(),
            gamestate_bucket: LeakyBucket::new(),
        }
    }

    /// Reset everything a new connection must not inherit. Address and
    /// the connect/disconnect times survive for slot selection.
    pub(crate) fn reset_session(&mut self) {
        self.transport = None;
        self.challenge = 0;
        self.name.clear();
        self.userinfo = UserInfo::new();
        self.reliable.reset();
        self.inbound.reset();
        self.frames.clear();
        self.delta_message = None;
        self.message_acknowledge = 0;
        self.gamestate_message = 0;
        self.last_usercmd = UserCmd::default();
        self.last_snapshot_time = None;
        self.rate_delayed = false;
        self.just_connected = false;
        self.cs_updated.fill(false);
        self.download = None;
        self.download_done_message = None;
        self.got_asset_ack = false;
        self.asset_authentic = false;
        self.cmd_bucket = LeakyBucket::new();
        self.info_bucket = LeakyBucket::new();
        self.gamestate_bucket = LeakyBucket::new();
    }

    /// Slot index; also the participant's entity id.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Connection state.
    pub fn state(&self) -> ParticipantState {
        self.state
    }

    /// Peer kind.
    pub fn kind(&self) -> PeerKind {
        self.kind
    }

    /// True for host-driven participants.
    pub fn is_bot(&self) -> bool {
        self.kind == PeerKind::Bot
    }

    /// Network address, if any.
    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    /// Display name from the userinfo.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current userinfo.
    pub fn userinfo(&self) -> &UserInfo {
        &self.userinfo
    }

    /// Outgoing path, absent for bots and free slots.
    pub fn transport(&self) -> Option<&TransportQueue> {
        self.transport.as_ref()
    }

    /// Host → participant reliable ring.
    pub fn reliable(&self) -> &ReliableRing {
        &self.reliable
    }

    /// Frame history.
    pub fn frames(&self) -> &FrameRing {
        &self.frames
    }

    /// Message the next snapshot may delta against.
    pub fn delta_message(&self) -> Option<i32> {
        self.delta_message
    }

    /// Milliseconds between snapshots.
    pub fn snapshot_msec(&self) -> u64 {
        self.snapshot_msec
    }

    /// True while a download is open.
    pub fn is_downloading(&self) -> bool {
        self.download.is_some()
    }

    /// Average round trip from acknowledged snapshots.
    pub fn ping(&self) -> u32 {
        self.frames.ping()
    }

    /// Outgoing sequence of the next message, 0 without a channel.
    pub(crate) fn outgoing_sequence(&self) -> i32 {
        self.transport
            .as_ref()
            .map_or(0, |t| t.chan().outgoing_sequence())
    }

    /// Send the next snapshot on the coming frame.
    pub(crate) fn snapshot_now(&mut self) {
        self.last_snapshot_time = None;
    }

    /// True when a snapshot is due at `now`.
    pub(crate) fn snapshot_due(&self, now: u64) -> bool {
        match self.last_snapshot_time {
            None => true,
            Some(last) => now.saturating_sub(last) >= self.snapshot_msec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_ordering() {
        assert!(ParticipantState::Active > ParticipantState::Primed);
        assert!(ParticipantState::Primed > ParticipantState::Connected);
        assert!(ParticipantState::Connected > ParticipantState::Zombie);
        assert!(ParticipantState::Zombie > ParticipantState::Free);
        assert_eq!(ParticipantState::Primed.to_string(), "primed");
    }

    #[test]
    fn test_drop_reason_text() {
        assert_eq!(DropReason::TimedOut.to_string(), "timed out");
        assert_eq!(DropReason::LostCommands.to_string(), "Lost reliable commands");
        assert_eq!(DropReason::Host("restarting".into()).to_string(), "restarting");
    }

    #[test]
    fn test_snapshot_due() {
        let mut p = Participant::new(0);
        assert!(p.snapshot_due(0));
        p.last_snapshot_time = Some(1000);
        p.snapshot_msec = 50;
        assert!(!p.snapshot_due(1049));
        assert!(p.snapshot_due(1050));
        p.snapshot_now();
        assert!(p.snapshot_due(1001));
    }

    #[test]
    fn test_reset_session_keeps_timing() {
        let mut p = Participant::new(3);
        p.last_disconnect_time = 500;
        p.name = "someone".into();
        p.reliable.push("print hi").unwrap();
        p.cs_updated[5] = true;
        p.reset_session();
        assert_eq!(p.last_disconnect_time, 500);
        assert!(p.name.is_empty());
        assert_eq!(p.reliable.sequence(), 0);
        assert!(!p.cs_updated[5]);
    }
}
