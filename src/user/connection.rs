//! The participant's connection: handshake, host message parsing and the
//! outgoing command stream.
//!
//! Like [`Host`](crate::host::Host) this is sans-I/O: feed datagrams to
//! [`process_packet`](UserConnection::process_packet), call
//! [`frame`](UserConnection::frame) regularly and send whatever
//! [`drain_outgoing`](UserConnection::drain_outgoing) returns.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::config::UserConfig;
use super::download::{BlockOutcome, IncomingDownload};
use super::snapshot::{SnapshotHistory, UserSnapshot, read_snapshot};
use crate::admission::{OobMessage, UserInfo, is_oob};
use crate::core::{ChannelError, CS_SYSTEM_INFO, LEGACY_PROTOCOL_VERSION, MAX_MSG_LEN, PROTOCOL_VERSION};
use crate::host::ConfigStrings;
use crate::snapshot::Baselines;
use crate::sync::{
    EntityState, HostOp, Inbound, InboundCommands, MessageError, MessageReader, MessageWriter, ReliableRing, UserCmd,
    UserOp, read_delta_entity, tokenize, write_usercmds,
};
use crate::transport::{ChannelSide, Datagram, Netchan, TransportError, host_reliable_ack, user_decode, user_encode};

/// Longest gap between packets while nothing else is being sent.
const KEEPALIVE_MS: u64 = 1000;

/// Copies of the final packet sent on disconnect.
const DISCONNECT_COPIES: usize = 3;

/// Where the connection is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UserState {
    /// Idle or torn down.
    Disconnected,
    /// Waiting for `challengeResponse`.
    Challenging,
    /// Waiting for `connectResponse`.
    Connecting,
    /// Channel open, no gamestate yet.
    Connected,
    /// Gamestate received, not yet in the world.
    Primed,
    /// Receiving snapshots in the world.
    Active,
}

impl fmt::Display for UserState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Challenging => "challenging",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Primed => "primed",
            Self::Active => "active",
        };
        f.write_str(s)
    }
}

/// Participant-side errors.
#[derive(Debug, Error)]
pub enum UserError {
    /// The operation needs an open channel.
    #[error("not connected")]
    NotConnected,

    /// A download is already running.
    #[error("download of {0} already in progress")]
    DownloadBusy(String),

    /// Malformed host message.
    #[error(transparent)]
    Message(#[from] MessageError),

    /// Channel-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Reliable command bookkeeping failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Something the application should react to.
#[derive(Debug, Clone, PartialEq)]
pub enum UserEvent {
    /// The host granted a slot.
    Connected,
    /// A full gamestate arrived; configstrings and baselines are fresh.
    Gamestate,
    /// A snapshot was decoded.
    Snapshot {
        /// Host simulation time of the snapshot.
        server_time: u32,
    },
    /// A configstring changed after the gamestate.
    ConfigstringChanged(usize),
    /// A reliable command the connection does not handle itself.
    Command(Vec<String>),
    /// Text from the host.
    Print(String),
    /// A requested file arrived.
    DownloadComplete {
        /// Requested name.
        name: String,
        /// File contents.
        data: Vec<u8>,
    },
    /// The host refused a requested file.
    DownloadFailed {
        /// Requested name.
        name: String,
        /// Host's explanation.
        reason: String,
    },
    /// The host refused the connection.
    Rejected(String),
    /// The connection ended.
    Disconnected(String),
}

/// Participant end of a host connection.
pub struct UserConnection {
    config: UserConfig,
    state: UserState,
    challenge: i32,
    echo: String,
    last_resend: Option<u64>,

    chan: Option<Netchan>,
    commands: ReliableRing,
    host_commands: InboundCommands,

    configstrings: ConfigStrings,
    /// Partial `bcs` configstring.
    big_configstring: String,
    baselines: Baselines,
    snapshots: SnapshotHistory,
    /// Message carrying the newest valid snapshot.
    latest_snapshot: Option<i32>,

    host_id: i32,
    participant_id: Option<usize>,
    checksum_feed: i32,
    download: Option<IncomingDownload>,

    last_packet_time: u64,
    last_sent_time: Option<u64>,
    events: VecDeque<UserEvent>,
    outbox: Vec<Datagram>,
}

impl fmt::Debug for UserConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserConnection")
            .field("host_addr", &self.config.host_addr)
            .field("state", &self.state)
            .field("host_id", &self.host_id)
            .field("participant_id", &self.participant_id)
            .finish_non_exhaustive()
    }
}

impl UserConnection {
    /// A disconnected connection to `config.host_addr`.
    pub fn new(config: UserConfig) -> Self {
        Self {
            config,
            state: UserState::Disconnected,
            challenge: 0,
            echo: String::new(),
            last_resend: None,
            chan: None,
            commands: ReliableRing::new(),
            host_commands: InboundCommands::new(),
            configstrings: ConfigStrings::new(),
            big_configstring: String::new(),
            baselines: Baselines::new(),
            snapshots: SnapshotHistory::new(),
            latest_snapshot: None,
            host_id: 0,
            participant_id: None,
            checksum_feed: 0,
            download: None,
            last_packet_time: 0,
            last_sent_time: None,
            events: VecDeque::new(),
            outbox: Vec::new(),
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &UserConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> UserState {
        self.state
    }

    /// World instance from the last gamestate; 0 before one arrives.
    pub fn host_id(&self) -> i32 {
        self.host_id
    }

    /// Slot the host assigned.
    pub fn participant_id(&self) -> Option<usize> {
        self.participant_id
    }

    /// Seed for asset checksums, from the gamestate.
    pub fn checksum_feed(&self) -> i32 {
        self.checksum_feed
    }

    /// Configstring `index`, empty if unset.
    pub fn configstring(&self, index: usize) -> &str {
        self.configstrings.get(index)
    }

    /// Baselines from the gamestate.
    pub fn baselines(&self) -> &Baselines {
        &self.baselines
    }

    /// Newest valid snapshot.
    pub fn latest_snapshot(&self) -> Option<&UserSnapshot> {
        self.latest_snapshot.and_then(|m| self.snapshots.get(m))
    }

    /// Snapshot received in message `sequence`, if still held.
    pub fn snapshot(&self, sequence: i32) -> Option<&UserSnapshot> {
        self.snapshots.get(sequence)
    }

    /// File currently being received.
    pub fn download_in_progress(&self) -> Option<&IncomingDownload> {
        self.download.as_ref()
    }

    /// The channel, once connected.
    pub fn channel(&self) -> Option<&Netchan> {
        self.chan.as_ref()
    }

    /// Time the last sequenced packet arrived.
    pub fn last_packet_time(&self) -> u64 {
        self.last_packet_time
    }

    /// Next pending event.
    pub fn poll_event(&mut self) -> Option<UserEvent> {
        self.events.pop_front()
    }

    /// Take everything queued for the wire.
    pub fn drain_outgoing(&mut self) -> Vec<Datagram> {
        std::mem::take(&mut self.outbox)
    }

    /// Start the handshake.
    pub fn connect(&mut self, now: u64) {
        self.reset();
        self.echo = rand::thread_rng().gen_range(0..i32::MAX).to_string();
        self.state = UserState::Challenging;
        info!(host = %self.config.host_addr, "requesting challenge");
        self.resend(now);
    }

    /// Queue a reliable command; returns its sequence.
    pub fn add_command(&mut self, text: impl Into<String>) -> Result<i32, UserError> {
        if self.chan.is_none() {
            return Err(UserError::NotConnected);
        }
        Ok(self.commands.push(text)?)
    }

    /// Request `name` from the host.
    pub fn download(&mut self, name: &str) -> Result<(), UserError> {
        if let Some(current) = &self.download {
            return Err(UserError::DownloadBusy(current.name().to_owned()));
        }
        self.add_command(format!("download {name}"))?;
        self.download = Some(IncomingDownload::new(name));
        Ok(())
    }

    /// Tell the host every wanted file is here.
    pub fn finish_downloads(&mut self) -> Result<(), UserError> {
        self.add_command("donedl").map(drop)
    }

    /// Send user commands, delta coded if the newest snapshot is current.
    pub fn send_move(&mut self, cmds: &[UserCmd], now: u64) -> Result<(), UserError> {
        if self.state < UserState::Connected {
            return Err(UserError::NotConnected);
        }
        self.send_packet(Some(cmds), now)
    }

    /// Leave the host. The final packet goes out several times since the
    /// host will not acknowledge it.
    pub fn disconnect(&mut self, now: u64) {
        if self.chan.is_some() {
            self.commands.force_push("disconnect");
            for _ in 0..DISCONNECT_COPIES {
                if let Err(e) = self.send_packet(None, now) {
                    debug!(error = %e, "disconnect send failed");
                    break;
                }
            }
        }
        if self.state != UserState::Disconnected {
            info!(host = %self.config.host_addr, "disconnected");
        }
        self.chan = None;
        self.state = UserState::Disconnected;
    }

    /// Periodic work: handshake retries and keepalives.
    pub fn frame(&mut self, now: u64) {
        match self.state {
            UserState::Disconnected => {}
            UserState::Challenging | UserState::Connecting => {
                let due = self
                    .last_resend
                    .is_none_or(|t| now.saturating_sub(t) >= self.config.resend_ms);
                if due {
                    self.resend(now);
                }
            }
            UserState::Connected | UserState::Primed | UserState::Active => {
                let idle = self
                    .last_sent_time
                    .is_none_or(|t| now.saturating_sub(t) >= KEEPALIVE_MS);
                // Downloads ack every frame to keep the window moving.
                if self.download.is_some() || idle {
                    if let Err(e) = self.send_packet(None, now) {
                        warn!(error = %e, "send failed");
                    }
                }
            }
        }
    }

    /// Handle one datagram.
    pub fn process_packet(&mut self, from: SocketAddr, packet: &[u8], now: u64) {
        if from != self.config.host_addr {
            debug!(%from, "packet from unexpected address");
            return;
        }
        if is_oob(packet) {
            self.handle_oob(packet, now);
            return;
        }

        let Some(chan) = self.chan.as_mut() else {
            return;
        };
        let mut msg = match chan.process(packet) {
            Ok(msg) => msg,
            Err(TransportError::Incomplete) => return,
            Err(e) => {
                debug!(error = %e, "dropped packet");
                return;
            }
        };
        if chan.is_legacy() {
            let ack = host_reliable_ack(&msg).unwrap_or_default();
            user_decode(&mut msg, chan.challenge(), chan.incoming_sequence(), self.commands.slot_text(ack));
        }
        self.last_packet_time = now;

        if let Err(e) = self.parse_message(&msg) {
            warn!(error = %e, "bad host message");
        }
    }

    fn reset(&mut self) {
        self.chan = None;
        self.commands.reset();
        self.host_commands.reset();
        self.configstrings.clear();
        self.big_configstring.clear();
        self.baselines = Baselines::new();
        self.snapshots.clear();
        self.latest_snapshot = None;
        self.host_id = 0;
        self.participant_id = None;
        self.download = None;
        self.last_resend = None;
        self.last_sent_time = None;
    }

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------

    fn resend(&mut self, now: u64) {
        let msg = match self.state {
            UserState::Challenging => OobMessage::GetChallenge {
                echo: Some(self.echo.clone()),
            },
            UserState::Connecting => {
                let protocol = if self.config.legacy {
                    LEGACY_PROTOCOL_VERSION
                } else {
                    PROTOCOL_VERSION
                };
                let mut userinfo = self.config.userinfo.clone();
                userinfo.set("challenge", &self.challenge.to_string());
                userinfo.set("protocol", &protocol.to_string());
                userinfo.set("qport", &self.config.qport.to_string());
                OobMessage::Connect { userinfo }
            }
            _ => return,
        };
        self.last_resend = Some(now);
        self.outbox
            .push(Datagram::new(self.config.host_addr, msg.to_packet()));
    }

    fn handle_oob(&mut self, packet: &[u8], now: u64) {
        let Some(msg) = OobMessage::parse(packet) else {
            return;
        };
        match (self.state, msg) {
            (UserState::Challenging, OobMessage::ChallengeResponse { challenge, echo, .. }) => {
                if echo.as_deref().is_some_and(|e| e != self.echo) {
                    debug!("challenge response for another request");
                    return;
                }
                debug!(challenge, "challenge received");
                self.challenge = challenge;
                self.state = UserState::Connecting;
                self.resend(now);
            }
            (UserState::Connecting, OobMessage::ConnectResponse { challenge }) => {
                if challenge != self.challenge {
                    debug!(challenge, "connect response for another challenge");
                    return;
                }
                self.chan = Some(Netchan::new(
                    ChannelSide::User,
                    self.config.host_addr,
                    self.config.qport,
                    challenge,
                    self.config.legacy,
                ));
                self.state = UserState::Connected;
                self.last_packet_time = now;
                info!(host = %self.config.host_addr, "connected");
                self.events.push_back(UserEvent::Connected);
                if let Err(e) = self.send_packet(None, now) {
                    warn!(error = %e, "send failed");
                }
            }
            (UserState::Challenging | UserState::Connecting, OobMessage::Print(reason)) => {
                info!(%reason, "connection refused");
                self.state = UserState::Disconnected;
                self.events.push_back(UserEvent::Rejected(reason));
            }
            (_, OobMessage::Print(text)) => self.events.push_back(UserEvent::Print(text)),
            (state, OobMessage::Disconnect) if state >= UserState::Connected => {
                self.lost("host disconnected".into());
            }
            (_, other) => debug!(message = ?other, "ignored connectionless packet"),
        }
    }

    fn lost(&mut self, reason: String) {
        info!(%reason, "host ended the connection");
        self.chan = None;
        self.download = None;
        self.state = UserState::Disconnected;
        self.events.push_back(UserEvent::Disconnected(reason));
    }

    // ------------------------------------------------------------------
    // Outgoing
    // ------------------------------------------------------------------

    fn send_packet(&mut self, moves: Option<&[UserCmd]>, now: u64) -> Result<(), UserError> {
        let Some(chan) = self.chan.as_mut() else {
            return Err(UserError::NotConnected);
        };

        let mut w = MessageWriter::new(MAX_MSG_LEN);
        w.write_i32(self.host_id);
        w.write_i32(chan.incoming_sequence());
        w.write_i32(self.host_commands.last());
        for (sequence, text) in self.commands.pending() {
            w.write_user_op(UserOp::Command);
            w.write_i32(sequence);
            w.write_string(text);
        }
        if let Some(cmds) = moves.filter(|c| !c.is_empty()) {
            let delta = self
                .latest_snapshot
                .is_some_and(|m| m == chan.incoming_sequence());
            w.write_user_op(if delta { UserOp::Move } else { UserOp::MoveNoDelta });
            write_usercmds(&mut w, cmds);
        }
        w.write_user_op(UserOp::Eof);

        let mut data = w.finish()?;
        if chan.is_legacy() {
            user_encode(&mut data, chan.challenge(), self.host_commands.last_text());
        }
        let mut packet = chan.transmit(&data, now)?;
        loop {
            self.outbox.push(Datagram::new(chan.remote(), packet));
            if !chan.has_unsent_fragments() {
                break;
            }
            packet = chan.transmit_next_fragment(now)?;
        }
        self.last_sent_time = Some(now);
        Ok(())
    }

    fn queue_command(&mut self, text: String) {
        if let Err(e) = self.commands.push(text) {
            warn!(error = %e, "command dropped");
        }
    }

    // ------------------------------------------------------------------
    // Incoming
    // ------------------------------------------------------------------

    fn parse_message(&mut self, msg: &[u8]) -> Result<(), UserError> {
        let mut r = MessageReader::new(msg);
        let reliable_ack = r.read_i32()?;
        self.commands.acknowledge(reliable_ack)?;

        loop {
            match r.read_host_op()? {
                HostOp::Eof => break,
                HostOp::Nop => {}
                HostOp::Command => {
                    let sequence = r.read_i32()?;
                    let text = r.read_string()?;
                    self.host_command(sequence, &text);
                    if self.state == UserState::Disconnected {
                        break;
                    }
                }
                HostOp::Gamestate => self.parse_gamestate(&mut r)?,
                HostOp::Snapshot => self.parse_snapshot(&mut r)?,
                HostOp::Download => self.parse_download(&mut r)?,
                op @ (HostOp::Configstring | HostOp::Baseline | HostOp::Bad) => {
                    return Err(MessageError::InvalidFormat(format!("unexpected {op:?} outside a gamestate")).into());
                }
            }
        }
        Ok(())
    }

    fn host_command(&mut self, sequence: i32, text: &str) {
        match self.host_commands.classify(sequence) {
            Ok(Inbound::Duplicate) => return,
            Ok(Inbound::Next) => {}
            // The host never resends what fell out of its window.
            Err(e) => debug!(error = %e, "host commands skipped"),
        }
        self.host_commands.commit(sequence, text);

        let mut args = tokenize(text).into_iter();
        let Some(name) = args.next() else {
            return;
        };
        let args: Vec<String> = args.collect();
        let arg = |i: usize| args.get(i).cloned().unwrap_or_default();
        let index = args.first().and_then(|a| a.parse::<usize>().ok());

        match (name.as_str(), index) {
            ("disconnect", _) => self.lost(arg(0)),
            ("print", _) => self.events.push_back(UserEvent::Print(arg(0))),
            ("cs", Some(index)) => self.update_configstring(index, &arg(1)),
            ("bcs0", Some(_)) => self.big_configstring = arg(1),
            ("bcs1", Some(_)) => self.big_configstring.push_str(&arg(1)),
            ("bcs2", Some(index)) => {
                self.big_configstring.push_str(&arg(1));
                let value = std::mem::take(&mut self.big_configstring);
                self.update_configstring(index, &value);
            }
            _ => {
                let all = std::iter::once(name.clone()).chain(args.iter().cloned()).collect();
                self.events.push_back(UserEvent::Command(all));
            }
        }
    }

    fn update_configstring(&mut self, index: usize, value: &str) {
        if !self.configstrings.set(index, value) {
            return;
        }
        if index == CS_SYSTEM_INFO {
            self.host_id = parse_host_id(value);
        }
        self.events
            .push_back(UserEvent::ConfigstringChanged(index));
    }

    fn parse_gamestate(&mut self, r: &mut MessageReader<'_>) -> Result<(), UserError> {
        let sequence = r.read_i32()?;
        // Commands before the gamestate came in the same message.
        let text = self
            .host_commands
            .get(sequence)
            .unwrap_or_default()
            .to_owned();
        self.host_commands.commit(sequence, text);

        self.configstrings.clear();
        self.baselines = Baselines::new();
        loop {
            match r.read_host_op()? {
                HostOp::Eof => break,
                HostOp::Configstring => {
                    let index = r.read_u16()? as usize;
                    let value = r.read_string()?;
                    self.configstrings.set(index, &value);
                }
                HostOp::Baseline => {
                    let number = r.read_u16()?;
                    if let Some(state) = read_delta_entity(r, &EntityState::null(number), number)? {
                        self.baselines.set(state);
                    }
                }
                op => {
                    return Err(MessageError::InvalidFormat(format!("unexpected {op:?} in gamestate")).into());
                }
            }
        }
        let participant = r.read_i32()?;
        self.participant_id = usize::try_from(participant).ok();
        self.checksum_feed = r.read_i32()?;

        self.host_id = parse_host_id(self.configstrings.get(CS_SYSTEM_INFO));
        self.snapshots.clear();
        self.latest_snapshot = None;
        self.state = UserState::Primed;
        info!(
            host_id = self.host_id,
            participant,
            baselines = self.baselines.len(),
            "gamestate received"
        );
        self.events.push_back(UserEvent::Gamestate);
        Ok(())
    }

    fn parse_snapshot(&mut self, r: &mut MessageReader<'_>) -> Result<(), UserError> {
        let Some(message_num) = self.chan.as_ref().map(Netchan::incoming_sequence) else {
            return Ok(());
        };
        let Some(snap) = read_snapshot(r, message_num, &self.snapshots, &self.baselines)? else {
            return Ok(());
        };
        if self.state < UserState::Primed {
            return Ok(());
        }
        if self.state == UserState::Primed && !snap.not_active() {
            info!(server_time = snap.server_time, "entered the world");
            self.state = UserState::Active;
        }
        let server_time = snap.server_time;
        self.latest_snapshot = Some(message_num);
        self.snapshots.insert(snap);
        self.events
            .push_back(UserEvent::Snapshot { server_time });
        Ok(())
    }

    fn parse_download(&mut self, r: &mut MessageReader<'_>) -> Result<(), UserError> {
        let Some(download) = self.download.as_mut() else {
            // Unrequested; consume it so the rest parses.
            IncomingDownload::new("").read_block(r)?;
            return Ok(());
        };
        match download.read_block(r)? {
            BlockOutcome::Ignored => {}
            BlockOutcome::Accepted(block) => self.queue_command(format!("nextdl {block}")),
            BlockOutcome::Finished(block) => {
                self.queue_command(format!("nextdl {block}"));
                if let Some(done) = self.download.take() {
                    info!(file = done.name(), size = done.received(), "download complete");
                    let name = done.name().to_owned();
                    self.events.push_back(UserEvent::DownloadComplete {
                        name,
                        data: done.into_data(),
                    });
                }
            }
            BlockOutcome::Denied(reason) => {
                if let Some(failed) = self.download.take() {
                    info!(file = failed.name(), %reason, "download denied");
                    self.events.push_back(UserEvent::DownloadFailed {
                        name: failed.name().to_owned(),
                        reason,
                    });
                }
            }
        }
        Ok(())
    }
}

fn parse_host_id(systeminfo: &str) -> i32 {
    UserInfo::parse(systeminfo)
        .get("host_id")
        .and_then(|v| v.parse().ok())
        .unwrap_or_default()
}
