//! The host: admission, per-participant state machines and the tick loop.
//!
//! The host is sans-I/O. Feed it datagrams with
//! [`process_packet`](Host::process_packet), advance it with
//! [`run_frame`](Host::run_frame) and put whatever
//! [`drain_outgoing`](Host::drain_outgoing) returns on the wire.
//!
//! ```text
//! process_packet ──► OOB? ──► getchallenge / connect
//!        │
//!        └──► netchan ──► hostId, msgAck, relAck ──► commands ──► move
//!
//! run_frame ──► timeouts ──► simulation ──► common frame
//!          ──► drain queues ──► snapshots ──► download blocks
//! ```

use std::net::SocketAddr;

use rand::Rng;
use tracing::{debug, info, warn};

use super::config::HostConfig;
use super::configstrings::{ConfigStrings, update_commands};
use super::download::{
    BlockAck, Download, DownloadPolicy, FileStore, NoFiles, write_download_block, write_download_denial,
};
use super::participant::{DropReason, Participant, ParticipantState, PeerKind};
use super::simulation::{AcceptAllAssets, AssetVerifier, Simulation};
use super::table::{ConnectionTable, SlotChoice, SlotRequest};
use crate::admission::{AddressLimiter, ChallengeIssuer, ChallengeSecret, LeakyBucket, OobMessage, UserInfo, is_oob};
use crate::core::{
    ADDRESS_RATE_BURST, ADDRESS_RATE_PERIOD_MS, CS_SYSTEM_INFO, FLOOD_BURST, FLOOD_PERIOD_MS, GAMESTATE_BURST,
    GAMESTATE_PERIOD_MS, GLOBAL_RATE_BURST, GLOBAL_RATE_PERIOD_MS, HostError, LEGACY_PROTOCOL_VERSION, MAX_AREA_BYTES,
    MAX_ENTITIES, MAX_INFO_STRING, MAX_MSG_LEN, PROTOCOL_VERSION, SNAPFLAG_NOT_ACTIVE, SNAPFLAG_RATE_DELAYED,
    USERINFO_BURST, USERINFO_PERIOD_MS,
};
use crate::snapshot::{
    Baselines, CommonFrame, Generations, ParticipantFrame, SnapshotHeader, SnapshotStorage, visible_entities,
    write_snapshot,
};
use crate::sync::{
    EntityState, HostOp, Inbound, MessageError, MessageReader, MessageWriter, PlayerState, ReliableRing, UserCmd, UserOp,
    quote, read_usercmds, tokenize, write_delta_entity,
};
use crate::transport::{
    ChannelSide, Datagram, Netchan, RatePacer, TransportError, TransportQueue, host_decode, peek_qport,
    user_reliable_ack,
};

/// Authoritative end of the protocol.
pub struct Host<S: Simulation> {
    config: HostConfig,
    sim: S,
    table: ConnectionTable,
    configstrings: ConfigStrings,
    baselines: Baselines,
    storage: SnapshotStorage,
    generations: Generations,
    current_frame: Option<CommonFrame>,

    challenges: ChallengeIssuer,
    address_limiter: AddressLimiter,
    /// Outbound connectionless replies, all sources together.
    global_limit: LeakyBucket,

    files: Box<dyn FileStore>,
    verifier: Box<dyn AssetVerifier>,

    host_id: i32,
    checksum_feed: i32,
    load_time: u64,
    time: u32,

    outbox: Vec<Datagram>,
}

impl<S: Simulation> Host<S> {
    /// Validate `config` and load the world `sim` currently holds.
    pub fn new(config: HostConfig, sim: S) -> Result<Self, HostError> {
        config.validate()?;
        let mut host = Self {
            table: ConnectionTable::new(config.max_participants),
            configstrings: ConfigStrings::new(),
            baselines: Baselines::new(),
            storage: SnapshotStorage::new(config.snapshot_entities),
            generations: Generations::new(MAX_ENTITIES),
            current_frame: None,
            challenges: ChallengeIssuer::new(),
            address_limiter: AddressLimiter::new(ADDRESS_RATE_BURST, ADDRESS_RATE_PERIOD_MS),
            global_limit: LeakyBucket::new(),
            files: Box::new(NoFiles),
            verifier: Box::new(AcceptAllAssets),
            host_id: 0,
            checksum_feed: 0,
            load_time: 0,
            time: 0,
            outbox: Vec::new(),
            config,
            sim,
        };
        host.load_world(0);
        Ok(host)
    }

    /// Serve downloads from `store`.
    pub fn with_file_store(mut self, store: impl FileStore + 'static) -> Self {
        self.files = Box::new(store);
        self
    }

    /// Check `cp` acknowledgments with `verifier`.
    pub fn with_asset_verifier(mut self, verifier: impl AssetVerifier + 'static) -> Self {
        self.verifier = Box::new(verifier);
        self
    }

    /// Use a fixed challenge secret.
    pub fn with_challenge_secret(mut self, secret: ChallengeSecret) -> Self {
        self.challenges = ChallengeIssuer::with_secret(secret);
        self
    }

    /// Configuration.
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// The simulation.
    pub fn simulation(&self) -> &S {
        &self.sim
    }

    /// The simulation, mutably.
    pub fn simulation_mut(&mut self) -> &mut S {
        &mut self.sim
    }

    /// Id of the current world load.
    pub fn host_id(&self) -> i32 {
        self.host_id
    }

    /// Seed participants mix into their asset checksums.
    pub fn checksum_feed(&self) -> i32 {
        self.checksum_feed
    }

    /// Milliseconds since the world was loaded.
    pub fn time(&self) -> u32 {
        self.time
    }

    /// Slot `id`.
    pub fn participant(&self, id: usize) -> Option<&Participant> {
        self.table.get(id)
    }

    /// Every slot that owns a connection.
    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.table.occupied()
    }

    /// Broadcast-state value at `index`.
    pub fn configstring(&self, index: usize) -> &str {
        self.configstrings.get(index)
    }

    /// Take every datagram produced since the last call.
    pub fn drain_outgoing(&mut self) -> Vec<Datagram> {
        std::mem::take(&mut self.outbox)
    }

    // ------------------------------------------------------------------
    // World
    // ------------------------------------------------------------------

    /// (Re)load the world: new host id and checksum feed, fresh snapshot
    /// storage, baselines captured from the simulation's entities.
    ///
    /// Connected participants fall back to `Connected` and receive a new
    /// gamestate once they notice the host id changed.
    pub fn load_world(&mut self, now: u64) {
        let mut rng = rand::thread_rng();
        self.host_id = rng.gen_range(1..i32::MAX);
        self.checksum_feed = rng.r#gen();
        self.load_time = now;
        self.time = 0;
        self.storage = SnapshotStorage::new(self.config.snapshot_entities);
        self.current_frame = None;
        self.baselines.capture(self.sim.entities());
        self.configstrings
            .set(CS_SYSTEM_INFO, &format!("host_id={}", self.host_id));
        info!(
            host_id = self.host_id,
            baselines = self.baselines.len(),
            "world loaded"
        );

        let mut bots = Vec::new();
        for p in self.table.iter_mut() {
            if p.state < ParticipantState::Connected {
                continue;
            }
            if p.is_bot() {
                bots.push(p.id);
                continue;
            }
            p.state = ParticipantState::Connected;
            p.frames.clear();
            p.delta_message = None;
            p.cs_updated.fill(false);
            p.snapshot_now();
        }
        for id in bots {
            if let Err(reason) = self.sim.participant_connect(id, false, true) {
                self.drop_participant(id, DropReason::Host(reason), now);
                continue;
            }
            self.sim.participant_begin(id);
        }
    }

    /// Change a broadcast-state value and tell everyone who needs to know.
    ///
    /// Active participants get update commands now; primed ones get them
    /// when they enter the world.
    pub fn set_configstring(&mut self, index: usize, value: &str, now: u64) {
        if !self.configstrings.set(index, value) {
            return;
        }
        let commands = update_commands(index, value);
        let mut overflowed = Vec::new();
        for p in self.table.iter_mut() {
            match p.state {
                ParticipantState::Active if !p.is_bot() => {
                    for command in &commands {
                        if p.reliable.push(command.as_str()).is_err() {
                            overflowed.push(p.id);
                            break;
                        }
                    }
                }
                ParticipantState::Primed => p.cs_updated[index] = true,
                _ => {}
            }
        }
        for id in overflowed {
            self.drop_participant(id, DropReason::CommandOverflow, now);
        }
    }

    // ------------------------------------------------------------------
    // Reliable commands
    // ------------------------------------------------------------------

    /// Queue a reliable command for one participant. Overflowing the ring
    /// drops the participant.
    pub fn send_command(&mut self, id: usize, text: &str, now: u64) {
        let Some(p) = self.table.get_mut(id) else {
            return;
        };
        if p.is_bot() || p.state < ParticipantState::Connected {
            return;
        }
        if let Err(e) = p.reliable.push(text) {
            warn!(participant = id, error = %e, "reliable command overflow");
            self.drop_participant(id, DropReason::CommandOverflow, now);
        }
    }

    /// Queue a reliable command for every primed or active participant.
    pub fn broadcast_command(&mut self, text: &str, now: u64) {
        for id in self.queue_broadcast(text) {
            self.drop_participant(id, DropReason::CommandOverflow, now);
        }
    }

    /// Push `text` to every primed or active participant, returning the
    /// ones that overflowed.
    fn queue_broadcast(&mut self, text: &str) -> Vec<usize> {
        let mut overflowed = Vec::new();
        for p in self.table.iter_mut() {
            if p.is_bot() || p.state < ParticipantState::Primed {
                continue;
            }
            if let Err(e) = p.reliable.push(text) {
                warn!(participant = p.id, error = %e, "reliable command overflow");
                overflowed.push(p.id);
            }
        }
        overflowed
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Disconnect a participant.
    ///
    /// Everyone else is told, the simulation is notified and a final
    /// `disconnect` command is queued. Network participants linger as
    /// `Zombie` so that command can go out; bots are freed at once.
    pub fn drop_participant(&mut self, id: usize, reason: DropReason, now: u64) {
        let mut pending = vec![(id, reason)];
        while let Some((id, reason)) = pending.pop() {
            let Some(p) = self.table.get_mut(id) else {
                continue;
            };
            if p.state < ParticipantState::Connected {
                continue;
            }
            if let Some(download) = p.download.take() {
                debug!(participant = id, file = download.name(), "download closed");
            }
            info!(participant = id, name = %p.name, state = %p.state, %reason, "participant dropped");
            // Leave the broadcast set before the notice goes out.
            p.state = ParticipantState::Zombie;
            let notice = format!("print {}", quote(&format!("{} {reason}\n", p.name)));

            for other in self.queue_broadcast(&notice) {
                pending.push((other, DropReason::CommandOverflow));
            }
            self.sim.participant_disconnect(id);

            let Some(p) = self.table.get_mut(id) else {
                continue;
            };
            p.reliable
                .force_push(format!("disconnect {}", quote(&reason.to_string())));
            p.name.clear();
            p.userinfo = UserInfo::new();
            p.just_connected = false;
            p.last_disconnect_time = now;
            if p.is_bot() {
                p.reset_session();
                p.kind = PeerKind::Remote;
                p.state = ParticipantState::Free;
            } else {
                p.snapshot_now();
            }
        }
    }

    /// Drop a participant on the host's initiative.
    pub fn kick(&mut self, id: usize, now: u64) {
        self.drop_participant(id, DropReason::Kicked, now);
    }

    /// Drop everyone with `reason` and flush the final `disconnect`
    /// commands straight away.
    pub fn shutdown(&mut self, reason: &str, now: u64) {
        for id in 0..self.table.len() {
            self.drop_participant(id, DropReason::Host(reason.to_owned()), now);
        }
        // Sent twice; there is no later frame to retransmit in.
        for _ in 0..2 {
            for id in 0..self.table.len() {
                let Some(p) = self.table.get_mut(id) else {
                    continue;
                };
                if p.state != ParticipantState::Zombie {
                    continue;
                }
                let Some(t) = p.transport.as_mut() else {
                    continue;
                };
                t.clear();
                let mut w = MessageWriter::new(MAX_MSG_LEN);
                w.write_i32(p.inbound.last());
                write_reliable_commands(&mut w, &p.reliable);
                w.write_host_op(HostOp::Eof);
                match w.finish() {
                    Ok(data) => self.transmit(id, data, now),
                    Err(e) => warn!(participant = id, error = %e, "final message overflowed"),
                }
            }
        }
    }

    /// Occupy a free slot with a host-driven participant.
    ///
    /// Returns `None` when the table is full or the simulation refuses.
    pub fn connect_bot(&mut self, userinfo: UserInfo, now: u64) -> Option<usize> {
        let id = self
            .table
            .iter()
            .find(|p| p.state == ParticipantState::Free)
            .map(|p| p.id)?;
        let p = self.table.get_mut(id)?;
        p.reset_session();
        p.kind = PeerKind::Bot;
        p.address = None;
        p.userinfo = userinfo;
        p.state = ParticipantState::Active;
        p.last_packet_time = now;
        p.last_connect_time = now;
        self.apply_userinfo(id);

        if let Err(reason) = self.sim.participant_connect(id, true, true) {
            info!(participant = id, %reason, "bot refused");
            if let Some(p) = self.table.get_mut(id) {
                p.reset_session();
                p.kind = PeerKind::Remote;
                p.state = ParticipantState::Free;
            }
            return None;
        }
        info!(participant = id, "bot connected");
        self.sim.participant_begin(id);
        Some(id)
    }

    /// Run one input command for a bot.
    pub fn bot_think(&mut self, id: usize, cmd: &UserCmd) {
        let Some(p) = self.table.get_mut(id) else {
            return;
        };
        if !p.is_bot() || p.state != ParticipantState::Active {
            return;
        }
        p.last_usercmd = *cmd;
        self.sim.participant_think(id, cmd);
    }

    // ------------------------------------------------------------------
    // Incoming
    // ------------------------------------------------------------------

    /// Handle one received datagram.
    pub fn process_packet(&mut self, from: SocketAddr, packet: &[u8], now: u64) {
        if is_oob(packet) {
            self.handle_oob(from, packet, now);
            return;
        }
        let Some(qport) = peek_qport(packet) else {
            debug!(%from, len = packet.len(), "runt packet");
            return;
        };
        let Some(id) = self.table.find_sequenced(from, qport) else {
            debug!(%from, qport, "sequenced packet from unknown address");
            return;
        };
        let Some(msg) = self.receive(id, from, packet) else {
            return;
        };
        let Some(p) = self.table.get_mut(id) else {
            return;
        };
        // Zombies only linger to deliver the disconnect.
        if p.state == ParticipantState::Zombie {
            return;
        }
        p.last_packet_time = now;
        self.execute_user_message(id, &msg, now);
    }

    /// Run a packet through the participant's channel.
    fn receive(&mut self, id: usize, from: SocketAddr, packet: &[u8]) -> Option<Vec<u8>> {
        let p = self.table.get_mut(id)?;
        let t = p.transport.as_mut()?;
        let chan = t.chan_mut();
        let mut msg = match chan.process(packet) {
            Ok(msg) => msg,
            Err(TransportError::Incomplete) => return None,
            Err(e) if e.is_silent_drop() => {
                debug!(participant = id, %from, error = %e, "dropped packet");
                return None;
            }
            Err(e) => {
                warn!(participant = id, %from, error = %e, "discarding packet");
                return None;
            }
        };

        if chan.remote().port() != from.port() {
            info!(participant = id, old = %chan.remote(), new = %from, "fixing up translated port");
            chan.set_remote(from);
            p.address = Some(from);
        }

        if chan.is_legacy() {
            let ack = user_reliable_ack(&msg).unwrap_or_default();
            host_decode(&mut msg, chan.challenge(), p.reliable.slot_text(ack));
        }
        Some(msg)
    }

    fn handle_oob(&mut self, from: SocketAddr, packet: &[u8], now: u64) {
        let Some(msg) = OobMessage::parse(packet) else {
            return;
        };
        match msg {
            OobMessage::GetChallenge { echo } => self.get_challenge(from, echo, now),
            OobMessage::Connect { userinfo } => self.direct_connect(from, userinfo, now),
            OobMessage::Unknown(command) if command == "connect" => {
                self.reject(from, "Userinfo string length exceeded.", now);
            }
            other => debug!(%from, message = ?other, "ignored connectionless packet"),
        }
    }

    fn send_oob(&mut self, to: SocketAddr, msg: &OobMessage) {
        self.outbox.push(Datagram::new(to, msg.to_packet()));
    }

    /// Refuse a connection with a printed reason, unless flooded.
    fn reject(&mut self, to: SocketAddr, reason: &str, now: u64) {
        debug!(%to, reason, "connection rejected");
        if self
            .global_limit
            .is_limited(GLOBAL_RATE_BURST, GLOBAL_RATE_PERIOD_MS, now)
        {
            return;
        }
        self.send_oob(to, &OobMessage::Print(reason.to_owned()));
    }

    fn get_challenge(&mut self, from: SocketAddr, echo: Option<String>, now: u64) {
        if self.address_limiter.is_limited(from.ip(), now) {
            debug!(%from, "getchallenge rate limited");
            return;
        }
        if self
            .global_limit
            .is_limited(GLOBAL_RATE_BURST, GLOBAL_RATE_PERIOD_MS, now)
        {
            debug!(%from, "getchallenge flood");
            return;
        }
        let challenge = self.challenges.issue(&from, now);
        let protocol = echo.is_some().then_some(PROTOCOL_VERSION);
        self.send_oob(
            from,
            &OobMessage::ChallengeResponse {
                challenge,
                echo,
                protocol,
            },
        );
    }

    fn direct_connect(&mut self, from: SocketAddr, mut userinfo: UserInfo, now: u64) {
        let local = from.ip().is_loopback();

        if !local && self.address_limiter.is_limited(from.ip(), now) {
            debug!(%from, "connect rate limited");
            return;
        }

        if !local
            && self.config.max_per_address > 0
            && self.table.connections_from(from.ip()) >= self.config.max_per_address
        {
            self.reject(from, "Too many connections.", now);
            return;
        }

        let challenge = userinfo
            .get("challenge")
            .and_then(|c| c.parse::<i32>().ok())
            .unwrap_or_default();
        if !local && !self.challenges.verify(challenge, &from, now) {
            debug!(%from, challenge, "bad challenge");
            return;
        }

        let legacy = match userinfo.get("protocol").map(|v| v.parse::<i32>().unwrap_or_default()) {
            None => {
                self.reject(from, "Missing protocol in userinfo.", now);
                return;
            }
            Some(PROTOCOL_VERSION) => false,
            Some(LEGACY_PROTOCOL_VERSION) => true,
            Some(other) => {
                let reason = format!("Host uses protocol version {PROTOCOL_VERSION} (yours is {other}).");
                self.reject(from, &reason, now);
                return;
            }
        };

        let Some(qport) = userinfo.get("qport").and_then(|q| q.parse::<u16>().ok()) else {
            self.reject(from, "Missing qport in userinfo.", now);
            return;
        };

        for key in ["challenge", "qport", "protocol"] {
            userinfo.remove(key);
        }
        let ip = if local {
            "localhost".to_owned()
        } else {
            from.ip().to_string()
        };
        userinfo.set("ip", &ip);
        if userinfo.encode().len() >= MAX_INFO_STRING {
            self.reject(from, "Userinfo string length exceeded.", now);
            return;
        }

        // A completed handshake should not count against the source.
        self.address_limiter.restore(from.ip(), 1);

        let privileged = self
            .config
            .private_password
            .as_deref()
            .is_some_and(|pw| userinfo.get("password") == Some(pw));
        let request = SlotRequest {
            from,
            qport,
            privileged,
            local,
            private_slots: self.config.private_slots,
            reconnect_limit_ms: self.config.reconnect_limit_secs * 1000,
        };

        let id = match self.table.select_slot(&request, now) {
            SlotChoice::Cooldown(secs) => {
                debug!(%from, secs, "reconnect rejected: too soon");
                return;
            }
            SlotChoice::Reuse(id) => {
                info!(participant = id, %from, "reconnect");
                if self
                    .table
                    .get(id)
                    .is_some_and(|p| p.state >= ParticipantState::Connected)
                {
                    self.sim.participant_disconnect(id);
                }
                id
            }
            SlotChoice::Fresh(id) => id,
            SlotChoice::EvictBot(id) => {
                self.drop_participant(id, DropReason::Evicted, now);
                id
            }
            SlotChoice::Full => {
                self.reject(from, "Host is full.", now);
                return;
            }
        };

        let Some(p) = self.table.get_mut(id) else {
            return;
        };
        p.reset_session();
        p.kind = if local {
            PeerKind::Loopback
        } else {
            PeerKind::Remote
        };
        p.address = Some(from);
        p.challenge = challenge;
        p.transport = Some(TransportQueue::new(
            Netchan::new(ChannelSide::Host, from, qport, challenge, legacy),
            RatePacer::new(0, from.is_ipv6()),
        ));
        p.userinfo = userinfo;

        if let Err(reason) = self.sim.participant_connect(id, true, false) {
            info!(participant = id, %from, %reason, "simulation refused connection");
            if let Some(p) = self.table.get_mut(id) {
                p.reset_session();
                p.state = ParticipantState::Free;
            }
            self.reject(from, &reason, now);
            return;
        }
        self.apply_userinfo(id);

        let Some(p) = self.table.get_mut(id) else {
            return;
        };
        p.state = ParticipantState::Connected;
        p.snapshot_now();
        p.last_packet_time = now;
        p.last_connect_time = now;
        p.just_connected = true;
        // The first packet carries a stale host id, which triggers the
        // gamestate because nothing newer was ever sent.
        p.gamestate_message = -1;
        info!(participant = id, %from, legacy, "participant connected");
        self.send_oob(from, &OobMessage::ConnectResponse { challenge });
    }

    /// Pull name, rate and snapshot interval out of the userinfo.
    fn apply_userinfo(&mut self, id: usize) {
        let config = &self.config;
        let Some(p) = self.table.get_mut(id) else {
            return;
        };
        p.name = p.userinfo.get("name").unwrap_or_default().to_owned();

        let rate = if p.kind == PeerKind::Remote {
            let mut rate = p
                .userinfo
                .get("rate")
                .and_then(|r| r.parse::<u32>().ok())
                .unwrap_or(config.default_rate);
            if config.min_rate > 0 {
                rate = rate.max(config.min_rate);
            }
            if config.max_rate > 0 {
                rate = rate.min(config.max_rate);
            }
            rate
        } else {
            0
        };
        if let Some(t) = p.transport.as_mut() {
            t.pacer_mut().set_rate(rate);
        }

        let snaps = if p.kind == PeerKind::Remote {
            p.userinfo
                .get("snaps")
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(config.snapshot_rate)
                .clamp(1, config.snapshot_rate)
        } else {
            config.snapshot_rate
        };
        let msec = 1000 / u64::from(snaps);
        if msec != p.snapshot_msec {
            p.snapshot_msec = msec;
            p.snapshot_now();
        }
    }

    fn execute_user_message(&mut self, id: usize, msg: &[u8], now: u64) {
        let mut r = MessageReader::new(msg);
        let (Ok(host_id), Ok(message_ack), Ok(reliable_ack)) = (r.read_i32(), r.read_i32(), r.read_i32()) else {
            debug!(participant = id, "short message header");
            return;
        };

        let Some(p) = self.table.get_mut(id) else {
            return;
        };
        if p.outgoing_sequence().wrapping_sub(message_ack) <= 0 {
            debug!(participant = id, message_ack, "illegible message acknowledge");
            return;
        }
        if let Err(e) = p.reliable.acknowledge(reliable_ack) {
            debug!(participant = id, error = %e, "dropped message");
            return;
        }
        p.message_acknowledge = message_ack;
        p.just_connected = false;

        if host_id != self.host_id && p.download.is_none() && !p.inbound.last_text().contains("nextdl") {
            // The participant has not caught up with the current world. If
            // it dropped the gamestate, send it again.
            if p.state != ParticipantState::Active
                && message_ack.wrapping_sub(p.gamestate_message) > 0
                && !p
                    .gamestate_bucket
                    .is_limited(GAMESTATE_BURST, GAMESTATE_PERIOD_MS, now)
            {
                self.send_gamestate(id, now);
            }
            return;
        }

        loop {
            let op = match r.read_user_op() {
                Ok(op) => op,
                Err(e) => {
                    warn!(participant = id, error = %e, "bad command byte");
                    return;
                }
            };
            match op {
                UserOp::Eof => break,
                UserOp::Nop => {}
                UserOp::Command => {
                    let (Ok(sequence), Ok(text)) = (r.read_i32(), r.read_string()) else {
                        debug!(participant = id, "truncated reliable command");
                        return;
                    };
                    if !self.user_command(id, sequence, &text, now) {
                        return;
                    }
                    if self
                        .table
                        .get(id)
                        .is_none_or(|p| p.state == ParticipantState::Zombie)
                    {
                        return;
                    }
                }
                UserOp::Move | UserOp::MoveNoDelta => {
                    self.user_move(id, &mut r, op == UserOp::Move, now);
                }
                UserOp::Bad => {
                    warn!(participant = id, "bad command byte");
                    return;
                }
            }
        }
    }

    /// Sequence and execute one reliable command. False stops processing
    /// of the rest of the message.
    fn user_command(&mut self, id: usize, sequence: i32, text: &str, now: u64) -> bool {
        let Some(p) = self.table.get(id) else {
            return false;
        };
        match p.inbound.classify(sequence) {
            Ok(Inbound::Duplicate) => return true,
            Ok(Inbound::Next) => {}
            Err(e) => {
                warn!(participant = id, error = %e, "reliable command gap");
                self.drop_participant(id, DropReason::LostCommands, now);
                return false;
            }
        }

        if !self.execute_command(id, text, now) {
            return false;
        }
        if let Some(p) = self.table.get_mut(id) {
            p.inbound.commit(sequence, text);
        }
        true
    }

    /// Run a built-in command or hand the text to the simulation. False
    /// means the command was refused and must be resent.
    fn execute_command(&mut self, id: usize, text: &str, now: u64) -> bool {
        let args = tokenize(text);
        let Some(name) = args.first() else {
            return true;
        };
        let Some(p) = self.table.get_mut(id) else {
            return true;
        };
        let flood_protected = !p.is_bot() && p.state >= ParticipantState::Active;
        let arg = args.get(1).map(String::as_str);

        let builtin = match name.as_str() {
            "userinfo" => {
                if flood_protected
                    && p
                        .info_bucket
                        .is_limited(USERINFO_BURST, USERINFO_PERIOD_MS, now)
                {
                    debug!(participant = id, "userinfo flood");
                    return false;
                }
                self.cmd_userinfo(id, arg, now);
                true
            }
            "disconnect" => {
                self.drop_participant(id, DropReason::Disconnected, now);
                true
            }
            "cp" => {
                self.cmd_verify_assets(id, &args, now);
                true
            }
            "vdr" => {
                p.got_asset_ack = false;
                p.asset_authentic = false;
                true
            }
            "download" => {
                self.cmd_begin_download(id, arg, now);
                true
            }
            "nextdl" => {
                self.cmd_next_download(id, arg, now);
                true
            }
            "stopdl" => {
                if let Some(download) = p.download.take() {
                    info!(participant = id, file = download.name(), "download stopped");
                }
                true
            }
            "donedl" => {
                self.cmd_done_download(id, now);
                true
            }
            _ => false,
        };
        if builtin {
            return true;
        }

        let Some(p) = self.table.get_mut(id) else {
            return true;
        };
        if self.config.flood_protect
            && flood_protected
            && p.cmd_bucket.is_limited(FLOOD_BURST, FLOOD_PERIOD_MS, now)
        {
            debug!(participant = id, command = %name, "command flood, ignored");
        } else if p.state >= ParticipantState::Primed {
            self.sim.participant_command(id, &args);
        }
        true
    }

    fn cmd_userinfo(&mut self, id: usize, raw: Option<&str>, now: u64) {
        let Some(raw) = raw.filter(|r| !r.is_empty()) else {
            return;
        };
        let mut info = UserInfo::parse(raw);
        let Some(p) = self.table.get_mut(id) else {
            return;
        };
        let ip = match (p.kind, p.address) {
            (PeerKind::Loopback, _) => "localhost".to_owned(),
            (_, Some(addr)) => addr.ip().to_string(),
            (_, None) => "bot".to_owned(),
        };
        info.set("ip", &ip);
        if info.encode().len() >= MAX_INFO_STRING {
            self.drop_participant(id, DropReason::UserinfoTooLong, now);
            return;
        }
        p.userinfo = info;
        self.apply_userinfo(id);
        if let Some(p) = self.table.get(id) {
            self.sim.participant_userinfo_changed(id, &p.userinfo);
        }
    }

    /// `cp <hostId> <checksums...>`
    fn cmd_verify_assets(&mut self, id: usize, args: &[String], now: u64) {
        if !self.config.require_asset_ack {
            return;
        }
        let mut good = match args.get(1).and_then(|a| a.parse::<i32>().ok()) {
            None => false,
            Some(host_id) if host_id != self.host_id => {
                debug!(participant = id, host_id, "ignoring outdated cp command");
                return;
            }
            Some(_) => true,
        };

        let checksums: Result<Vec<i32>, _> = args.iter().skip(2).map(|a| a.parse::<i32>()).collect();
        match checksums {
            Ok(checksums) if good => good = self.verifier.verify(self.checksum_feed, &checksums),
            _ => good = false,
        }

        let Some(p) = self.table.get_mut(id) else {
            return;
        };
        p.got_asset_ack = true;
        p.asset_authentic = good;
        if !good {
            self.drop_participant(id, DropReason::UnpureUser, now);
        }
    }

    fn cmd_begin_download(&mut self, id: usize, name: Option<&str>, now: u64) {
        let Some(name) = name.filter(|n| !n.is_empty()) else {
            return;
        };
        let policy = DownloadPolicy {
            allow: self.config.allow_download,
            references: &self.config.download_references,
            protected: &self.config.protected_downloads,
        };
        let result = Download::begin(name, &policy, self.files.as_ref());

        let Some(p) = self.table.get_mut(id) else {
            return;
        };
        p.download = None;
        match result {
            Ok(download) => {
                info!(participant = id, file = name, size = download.size(), "download started");
                p.download = Some(download);
                p.download_done_message = None;
            }
            Err(reason) => {
                info!(participant = id, %reason, "download denied");
                let mut w = MessageWriter::new(MAX_MSG_LEN);
                w.write_i32(p.inbound.last());
                write_download_denial(&mut w, &reason);
                w.write_host_op(HostOp::Eof);
                match w.finish() {
                    Ok(data) => self.transmit(id, data, now),
                    Err(e) => warn!(participant = id, error = %e, "download denial overflowed"),
                }
            }
        }
    }

    /// `nextdl <block>`: cumulative acknowledgment.
    fn cmd_next_download(&mut self, id: usize, block: Option<&str>, now: u64) {
        let Some(block) = block.and_then(|b| b.parse::<u32>().ok()) else {
            return;
        };
        let Some(p) = self.table.get_mut(id) else {
            return;
        };
        let Some(download) = p.download.as_mut() else {
            return;
        };
        match download.acknowledge(block, now) {
            BlockAck::Stale | BlockAck::Advanced => {}
            BlockAck::Complete => {
                info!(participant = id, file = download.name(), "download complete");
                p.download = None;
                p.download_done_message = Some(p.outgoing_sequence());
                if p.state != ParticipantState::Active {
                    self.send_gamestate(id, now);
                }
            }
            BlockAck::Broken => {
                warn!(participant = id, block, "acknowledged a block never sent");
                self.drop_participant(id, DropReason::BrokenDownload, now);
            }
        }
    }

    /// `donedl`: the participant finished with downloads.
    fn cmd_done_download(&mut self, id: usize, now: u64) {
        let Some(p) = self.table.get(id) else {
            return;
        };
        if p.state == ParticipantState::Active {
            return;
        }
        let already_sent = p
            .download_done_message
            .is_some_and(|done| p.gamestate_message.wrapping_sub(done) >= 0);
        if !already_sent {
            self.send_gamestate(id, now);
        }
    }

    fn user_move(&mut self, id: usize, r: &mut MessageReader<'_>, delta: bool, now: u64) {
        let cmds = match read_usercmds(r) {
            Ok(cmds) => cmds,
            Err(e) => {
                warn!(participant = id, error = %e, "bad move");
                return;
            }
        };
        let Some(p) = self.table.get_mut(id) else {
            return;
        };
        p.delta_message = delta.then_some(p.message_acknowledge);
        p.frames.acknowledge(p.message_acknowledge, now);

        if p.state == ParticipantState::Primed {
            if self.config.require_asset_ack && !p.got_asset_ack {
                if !p
                    .gamestate_bucket
                    .is_limited(GAMESTATE_BURST, GAMESTATE_PERIOD_MS, now)
                {
                    debug!(participant = id, "no asset acknowledgment, resending gamestate");
                    self.send_gamestate(id, now);
                }
                return;
            }
            self.enter_world(id, cmds[0], now);
        }

        let Some(p) = self.table.get_mut(id) else {
            return;
        };
        if self.config.require_asset_ack && !p.asset_authentic {
            self.drop_participant(id, DropReason::CannotValidate, now);
            return;
        }
        if p.state != ParticipantState::Active {
            p.delta_message = None;
            return;
        }

        let newest = cmds[cmds.len() - 1].server_time;
        for cmd in &cmds {
            // From before a world reload.
            if (cmd.server_time.wrapping_sub(newest) as i32) > 0 {
                continue;
            }
            // Already executed; repeated for loss tolerance.
            if (cmd.server_time.wrapping_sub(p.last_usercmd.server_time) as i32) <= 0 {
                continue;
            }
            p.last_usercmd = *cmd;
            self.sim.participant_think(id, cmd);
        }
    }

    fn enter_world(&mut self, id: usize, cmd: UserCmd, now: u64) {
        let Some(p) = self.table.get_mut(id) else {
            return;
        };
        info!(participant = id, name = %p.name, "entered world");
        p.state = ParticipantState::Active;
        p.delta_message = None;
        p.snapshot_now();
        p.last_usercmd = cmd;

        // Broadcast state that changed while primed.
        let updated: Vec<usize> = (0..p.cs_updated.len()).filter(|&i| p.cs_updated[i]).collect();
        p.cs_updated.fill(false);
        for index in updated {
            for command in update_commands(index, self.configstrings.get(index)) {
                self.send_command(id, &command, now);
            }
        }
        if self
            .table
            .get(id)
            .is_some_and(|p| p.state == ParticipantState::Active)
        {
            self.sim.participant_begin(id);
        }
    }

    // ------------------------------------------------------------------
    // Outgoing
    // ------------------------------------------------------------------

    /// Send the complete broadcast state and baselines.
    fn send_gamestate(&mut self, id: usize, now: u64) {
        let Some(p) = self.table.get_mut(id) else {
            return;
        };
        debug!(participant = id, "sending gamestate");
        p.state = ParticipantState::Primed;
        p.got_asset_ack = false;
        p.asset_authentic = false;
        p.gamestate_message = p.outgoing_sequence();
        p.cs_updated.fill(false);

        let Some(p) = self.table.get(id) else {
            return;
        };
        match self.write_gamestate(p) {
            Ok(data) => self.transmit(id, data, now),
            Err(e) => {
                warn!(participant = id, error = %e, "gamestate overflow");
                if let Some(addr) = p.address {
                    self.send_oob(addr, &OobMessage::Print("HOST ERROR: gamestate overflow".into()));
                }
                self.drop_participant(id, DropReason::GamestateOverflow, now);
            }
        }
    }

    fn write_gamestate(&self, p: &Participant) -> Result<Vec<u8>, MessageError> {
        let mut w = MessageWriter::new(MAX_MSG_LEN);
        w.write_i32(p.inbound.last());
        write_reliable_commands(&mut w, &p.reliable);

        w.write_host_op(HostOp::Gamestate);
        w.write_i32(p.reliable.sequence());
        for (index, value) in self.configstrings.iter() {
            w.write_host_op(HostOp::Configstring);
            w.write_u16(index as u16);
            w.write_big_string(value);
        }
        for baseline in self.baselines.iter() {
            w.write_host_op(HostOp::Baseline);
            write_delta_entity(&mut w, &EntityState::null(baseline.number), Some(baseline), true)?;
        }
        w.write_host_op(HostOp::Eof);
        w.write_i32(p.id as i32);
        w.write_i32(self.checksum_feed);
        w.write_host_op(HostOp::Eof);
        w.finish()
    }

    /// Hand a finished message to the participant's transport queue.
    fn transmit(&mut self, id: usize, data: Vec<u8>, now: u64) {
        let Some(p) = self.table.get_mut(id) else {
            return;
        };
        let Some(t) = p.transport.as_mut() else {
            return;
        };
        match t.transmit(data, p.inbound.last_text(), now) {
            Ok(Some(packet)) => self.outbox.push(Datagram::new(t.chan().remote(), packet)),
            Ok(None) => {}
            Err(e) => warn!(participant = id, error = %e, "transmit failed"),
        }
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    /// Advance one tick.
    ///
    /// Errors are invariant violations in snapshot storage or visibility;
    /// see [`HostError::is_fatal`].
    pub fn run_frame(&mut self, now: u64) -> Result<(), HostError> {
        self.check_timeouts(now);
        self.address_limiter.prune(now);

        self.time = now.saturating_sub(self.load_time) as u32;
        self.sim.run_frame(self.time);

        let states: Vec<EntityState> = self
            .sim
            .entities()
            .iter()
            .enumerate()
            .take(MAX_ENTITIES - 1)
            .filter(|(_, e)| e.is_shared())
            .map(|(number, e)| {
                let mut state = e.state.clone();
                state.number = number as u16;
                state
            })
            .collect();
        self.current_frame = Some(self.storage.build(&states)?);

        self.drain_queues(now);
        for id in 0..self.table.len() {
            self.send_snapshot(id, now)?;
        }
        self.send_downloads(now);
        Ok(())
    }

    fn check_timeouts(&mut self, now: u64) {
        let linger = self.config.zombie_linger_ms;
        let timeout = self.config.timeout_ms;
        let mut timed_out = Vec::new();
        for p in self.table.iter_mut() {
            match p.state {
                ParticipantState::Zombie => {
                    if now.saturating_sub(p.last_packet_time.max(p.last_disconnect_time)) > linger {
                        debug!(participant = p.id, "zombie freed");
                        p.reset_session();
                        p.state = ParticipantState::Free;
                    }
                }
                ParticipantState::Free => {}
                _ if !p.is_bot() && now.saturating_sub(p.last_packet_time) > timeout => timed_out.push(p.id),
                _ => {}
            }
        }
        for id in timed_out {
            self.drop_participant(id, DropReason::TimedOut, now);
            // Nobody is listening for the disconnect.
            if let Some(p) = self.table.get_mut(id) {
                p.reset_session();
                p.state = ParticipantState::Free;
            }
        }
    }

    /// Send one pending fragment or queued message per participant.
    fn drain_queues(&mut self, now: u64) {
        for p in self.table.iter_mut() {
            let Some(t) = p.transport.as_mut() else {
                continue;
            };
            if !t.is_busy() || t.wait_ms(now) > 0 {
                continue;
            }
            match t.transmit_next(now) {
                Ok(packet) => self.outbox.push(Datagram::new(t.chan().remote(), packet)),
                Err(TransportError::Idle) => {}
                Err(e) => warn!(participant = p.id, error = %e, "queued transmit failed"),
            }
        }
    }

    fn send_snapshot(&mut self, id: usize, now: u64) -> Result<(), HostError> {
        let Some(common) = self.current_frame else {
            return Ok(());
        };
        let Some(p) = self.table.get_mut(id) else {
            return Ok(());
        };
        if p.state == ParticipantState::Free || p.download.is_some() || !p.snapshot_due(now) {
            return Ok(());
        }
        if let Some(t) = p.transport.as_ref() {
            if t.is_busy() || t.wait_ms(now) > 0 {
                p.rate_delayed = true;
                return Ok(());
            }
        }

        let sequence = p.outgoing_sequence();
        let mut frame = ParticipantFrame {
            sequence,
            frame_num: common.frame_num,
            server_time: self.time,
            player_state: PlayerState {
                participant: id as u8,
                ..PlayerState::default()
            },
            area_bytes: 0,
            area_bits: [0; MAX_AREA_BYTES],
            entity_slots: Vec::new(),
            message_sent: now,
            message_acked: None,
            message_size: 0,
        };
        if p.state >= ParticipantState::Primed {
            frame.player_state = self.sim.player_state(id);
            let visible = visible_entities(
                &self.storage,
                &common,
                self.sim.entities(),
                self.sim.visibility(),
                &frame.player_state,
                &mut self.generations,
                self.config.max_visible_entities,
            )?;
            frame.area_bytes = visible.area_bytes;
            frame.area_bits = visible.area_bits;
            frame.entity_slots = visible.slots;
        }

        p.last_snapshot_time = Some(now);
        if p.is_bot() {
            p.frames.insert(frame);
            return Ok(());
        }

        let mut flags = 0;
        if p.rate_delayed {
            flags |= SNAPFLAG_RATE_DELAYED;
        }
        if p.state != ParticipantState::Active {
            flags |= SNAPFLAG_NOT_ACTIVE;
        }
        p.rate_delayed = false;

        let reference = if p.state == ParticipantState::Active {
            p.frames
                .delta_reference(&self.storage, sequence, p.delta_message)
        } else {
            None
        };
        let header = SnapshotHeader {
            delta_num: reference.map_or(0, |(delta, _)| delta),
            flags,
        };

        let mut w = MessageWriter::new(MAX_MSG_LEN);
        w.write_i32(p.inbound.last());
        write_reliable_commands(&mut w, &p.reliable);
        let written = write_snapshot(
            &mut w,
            &self.storage,
            &self.baselines,
            &frame,
            reference.map(|(_, old)| old),
            header,
        );
        w.write_host_op(HostOp::Eof);
        let data = match written.and_then(|()| w.finish()) {
            Ok(data) => data,
            Err(e) => {
                warn!(participant = id, error = %e, "snapshot overflowed, sending empty message");
                let mut w = MessageWriter::new(MAX_MSG_LEN);
                w.write_i32(p.inbound.last());
                w.write_host_op(HostOp::Eof);
                w.finish()?
            }
        };

        frame.message_size = data.len();
        p.frames.insert(frame);
        self.transmit(id, data, now);
        Ok(())
    }

    /// One download block per downloading participant, when the channel is
    /// free.
    fn send_downloads(&mut self, now: u64) {
        for id in 0..self.table.len() {
            let Some(p) = self.table.get_mut(id) else {
                continue;
            };
            if p.state < ParticipantState::Connected {
                continue;
            }
            let Some(t) = p.transport.as_ref() else {
                continue;
            };
            if t.is_busy() || t.wait_ms(now) > 0 {
                continue;
            }
            let Some(download) = p.download.as_mut() else {
                continue;
            };
            let Some(block) = download.poll(now) else {
                continue;
            };

            let mut w = MessageWriter::new(MAX_MSG_LEN);
            w.write_i32(p.inbound.last());
            write_download_block(&mut w, &block);
            w.write_host_op(HostOp::Eof);
            match w.finish() {
                Ok(data) => self.transmit(id, data, now),
                Err(e) => warn!(participant = id, error = %e, "download block overflowed"),
            }
        }
    }
}

/// Every unacknowledged reliable command, oldest first.
fn write_reliable_commands(w: &mut MessageWriter, ring: &ReliableRing) {
    for (sequence, text) in ring.pending() {
        w.write_host_op(HostOp::Command);
        w.write_i32(sequence);
        w.write_string(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{OpenWorld, Placement, SharedEntity, VisibilityMap};
    use crate::sync::write_usercmds;

    #[derive(Default)]
    struct Arena {
        entities: Vec<SharedEntity>,
        log: Vec<String>,
        refuse: Option<String>,
    }

    impl Arena {
        fn with_entities(count: u16) -> Self {
            let entities = (0..count)
                .map(|n| {
                    SharedEntity::linked(
                        EntityState {
                            number: n,
                            origin: [f32::from(n), 0.0, 0.0],
                            ..EntityState::default()
                        },
                        Placement::at(0, 0),
                    )
                })
                .collect();
            Self {
                entities,
                ..Self::default()
            }
        }

        fn saw(&self, entry: &str) -> bool {
            self.log.iter().any(|l| l == entry)
        }
    }

    impl Simulation for Arena {
        fn participant_connect(&mut self, id: usize, _first_time: bool, _is_bot: bool) -> Result<(), String> {
            if let Some(reason) = &self.refuse {
                return Err(reason.clone());
            }
            self.log.push(format!("connect {id}"));
            Ok(())
        }

        fn participant_begin(&mut self, id: usize) {
            self.log.push(format!("begin {id}"));
        }

        fn participant_disconnect(&mut self, id: usize) {
            self.log.push(format!("disconnect {id}"));
        }

        fn participant_command(&mut self, id: usize, args: &[String]) {
            self.log.push(format!("command {id} {}", args.join(" ")));
        }

        fn participant_think(&mut self, id: usize, cmd: &UserCmd) {
            self.log.push(format!("think {id} {}", cmd.server_time));
        }

        fn entities(&self) -> &[SharedEntity] {
            &self.entities
        }

        fn player_state(&self, id: usize) -> PlayerState {
            PlayerState {
                participant: id as u8,
                ..PlayerState::default()
            }
        }

        fn visibility(&self) -> &dyn VisibilityMap {
            &OpenWorld
        }
    }

    const QPORT: u16 = 4242;

    fn addr(last: u8, port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last], port))
    }

    fn host(config: HostConfig, sim: Arena) -> Host<Arena> {
        Host::new(config, sim)
            .unwrap()
            .with_challenge_secret(ChallengeSecret::from_bytes([9; 32]))
    }

    fn oob_replies(host: &mut Host<Arena>, to: SocketAddr) -> Vec<OobMessage> {
        host.drain_outgoing()
            .into_iter()
            .filter(|d| d.addr == to)
            .filter_map(|d| OobMessage::parse(&d.data))
            .collect()
    }

    /// Minimal participant end built on the raw channel.
    struct Peer {
        addr: SocketAddr,
        chan: Netchan,
        commands: ReliableRing,
        acked_command: i32,
    }

    impl Peer {
        fn send(&mut self, host: &mut Host<Arena>, host_id: i32, usercmds: &[UserCmd], now: u64) {
            let mut w = MessageWriter::new(MAX_MSG_LEN);
            w.write_i32(host_id);
            w.write_i32(self.chan.incoming_sequence());
            w.write_i32(self.acked_command);
            for (sequence, text) in self.commands.pending() {
                w.write_user_op(UserOp::Command);
                w.write_i32(sequence);
                w.write_string(text);
            }
            if !usercmds.is_empty() {
                w.write_user_op(UserOp::Move);
                write_usercmds(&mut w, usercmds);
            }
            w.write_user_op(UserOp::Eof);
            let packet = self.chan.transmit(&w.finish().unwrap(), now).unwrap();
            host.process_packet(self.addr, &packet, now);
        }

        /// Ops of every sequenced message the host sent us.
        fn receive(&mut self, datagrams: &[Datagram]) -> Vec<Vec<u8>> {
            datagrams
                .iter()
                .filter(|d| d.addr == self.addr && !is_oob(&d.data))
                .filter_map(|d| self.chan.process(&d.data).ok())
                .collect()
        }
    }

    fn connect(host: &mut Host<Arena>, from: SocketAddr, protocol: i32, now: u64) -> Option<Peer> {
        host.process_packet(
            from,
            &OobMessage::GetChallenge {
                echo: Some("77".into()),
            }
            .to_packet(),
            now,
        );
        let challenge = match oob_replies(host, from).first()? {
            OobMessage::ChallengeResponse {
                challenge, protocol, ..
            } => {
                assert_eq!(*protocol, Some(PROTOCOL_VERSION));
                *challenge
            }
            other => panic!("unexpected {other:?}"),
        };

        let mut userinfo = UserInfo::new();
        userinfo.set("name", "tester");
        userinfo.set("challenge", &challenge.to_string());
        userinfo.set("protocol", &protocol.to_string());
        userinfo.set("qport", &QPORT.to_string());
        host.process_packet(from, &OobMessage::Connect { userinfo }.to_packet(), now);
        match oob_replies(host, from).first()? {
            OobMessage::ConnectResponse { challenge: c } if *c == challenge => Some(Peer {
                addr: from,
                chan: Netchan::new(ChannelSide::User, from, QPORT, challenge, false),
                commands: ReliableRing::new(),
                acked_command: 0,
            }),
            _ => None,
        }
    }

    fn first_op_after_commands(msg: &[u8]) -> (Vec<String>, HostOp) {
        let mut r = MessageReader::new(msg);
        r.read_i32().unwrap();
        let mut commands = Vec::new();
        loop {
            match r.read_host_op().unwrap() {
                HostOp::Command => {
                    r.read_i32().unwrap();
                    commands.push(r.read_string().unwrap());
                }
                op => return (commands, op),
            }
        }
    }

    fn cmd(time: u32) -> UserCmd {
        UserCmd {
            server_time: time,
            ..UserCmd::default()
        }
    }

    /// Connect, receive the gamestate and enter the world.
    fn join(host: &mut Host<Arena>, from: SocketAddr, now: u64) -> Peer {
        let mut peer = connect(host, from, PROTOCOL_VERSION, now).unwrap();
        peer.send(host, 0, &[], now);
        let out = host.drain_outgoing();
        let msgs = peer.receive(&out);
        assert_eq!(first_op_after_commands(&msgs[0]).1, HostOp::Gamestate);
        let host_id = host.host_id();
        peer.send(host, host_id, &[cmd(10)], now + 1);
        peer
    }

    #[test]
    fn test_challenge_response() {
        let mut host = host(HostConfig::default(), Arena::default());
        let from = addr(1, 5000);
        host.process_packet(from, &OobMessage::GetChallenge { echo: None }.to_packet(), 0);
        let replies = oob_replies(&mut host, from);
        assert!(matches!(
            replies.as_slice(),
            [OobMessage::ChallengeResponse { protocol: None, .. }]
        ));
    }

    #[test]
    fn test_bad_challenge_is_silent() {
        let mut host = host(HostConfig::default(), Arena::default());
        let from = addr(1, 5000);
        let mut userinfo = UserInfo::new();
        userinfo.set("challenge", "12345");
        userinfo.set("protocol", "71");
        userinfo.set("qport", "1");
        host.process_packet(from, &OobMessage::Connect { userinfo }.to_packet(), 0);
        assert!(host.drain_outgoing().is_empty());
        assert_eq!(host.participants().count(), 0);
    }

    #[test]
    fn test_wrong_protocol_rejected() {
        let mut host = host(HostConfig::default(), Arena::default());
        let from = addr(1, 5000);
        host.process_packet(from, &OobMessage::GetChallenge { echo: None }.to_packet(), 0);
        let Some(OobMessage::ChallengeResponse { challenge, .. }) = oob_replies(&mut host, from).pop() else {
            panic!("no challenge");
        };
        let mut userinfo = UserInfo::new();
        userinfo.set("challenge", &challenge.to_string());
        userinfo.set("protocol", "43");
        userinfo.set("qport", "1");
        host.process_packet(from, &OobMessage::Connect { userinfo }.to_packet(), 0);
        assert_eq!(
            oob_replies(&mut host, from),
            vec![OobMessage::Print(
                "Host uses protocol version 71 (yours is 43).".into()
            )]
        );
    }

    #[test]
    fn test_connect_and_enter_world() {
        let mut host = host(HostConfig::default(), Arena::with_entities(4));
        let from = addr(2, 6000);
        let mut peer = connect(&mut host, from, PROTOCOL_VERSION, 0).unwrap();
        let p = host.participant(0).unwrap();
        assert_eq!(p.state(), ParticipantState::Connected);
        assert_eq!(p.name(), "tester");
        assert_eq!(p.userinfo().get("ip"), Some("10.0.0.2"));
        assert!(p.userinfo().get("challenge").is_none());

        // First packet carries no host id yet.
        peer.send(&mut host, 0, &[], 10);
        assert_eq!(host.participant(0).unwrap().state(), ParticipantState::Primed);
        let out = host.drain_outgoing();
        let msgs = peer.receive(&out);
        assert_eq!(msgs.len(), 1);
        assert_eq!(first_op_after_commands(&msgs[0]).1, HostOp::Gamestate);

        let host_id = host.host_id();
        peer.send(&mut host, host_id, &[cmd(100), cmd(116)], 20);
        assert_eq!(host.participant(0).unwrap().state(), ParticipantState::Active);
        assert!(host.simulation().saw("begin 0"));
        // The first command enters the world, the rest are executed.
        assert!(!host.simulation().saw("think 0 100"));
        assert!(host.simulation().saw("think 0 116"));

        host.run_frame(30).unwrap();
        let out = host.drain_outgoing();
        let msgs = peer.receive(&out);
        assert_eq!(first_op_after_commands(&msgs[0]).1, HostOp::Snapshot);
    }

    #[test]
    fn test_reliable_commands_run_once() {
        let mut host = host(HostConfig::default(), Arena::default());
        let mut peer = join(&mut host, addr(3, 7000), 0);
        let host_id = host.host_id();

        peer.commands.push("say hello").unwrap();
        peer.send(&mut host, host_id, &[], 10);
        peer.send(&mut host, host_id, &[], 20);
        let said = host
            .simulation()
            .log
            .iter()
            .filter(|l| l.as_str() == "command 0 say hello")
            .count();
        assert_eq!(said, 1);
    }

    #[test]
    fn test_command_gap_drops() {
        let mut host = host(HostConfig::default(), Arena::default());
        let mut peer = join(&mut host, addr(3, 7000), 0);
        let host_id = host.host_id();

        peer.commands.force_push("skipped");
        peer.commands.acknowledge(1).unwrap();
        peer.commands.push("say late").unwrap();
        peer.send(&mut host, host_id, &[], 10);
        let p = host.participant(0).unwrap();
        assert_eq!(p.state(), ParticipantState::Zombie);
        assert!(host.simulation().saw("disconnect 0"));
        assert!(!host.simulation().saw("command 0 say late"));
    }

    #[test]
    fn test_disconnect_command_and_zombie_linger() {
        let config = HostConfig {
            zombie_linger_ms: 500,
            ..HostConfig::default()
        };
        let mut host = host(config, Arena::default());
        let mut peer = join(&mut host, addr(4, 7000), 0);
        let host_id = host.host_id();

        peer.commands.push("disconnect").unwrap();
        peer.send(&mut host, host_id, &[], 10);
        let p = host.participant(0).unwrap();
        assert_eq!(p.state(), ParticipantState::Zombie);
        assert!(
            p.reliable()
                .pending()
                .any(|(_, text)| text == "disconnect \"disconnected\"")
        );

        host.run_frame(100).unwrap();
        assert_eq!(host.participant(0).unwrap().state(), ParticipantState::Zombie);
        host.run_frame(600).unwrap();
        assert_eq!(host.participant(0).unwrap().state(), ParticipantState::Free);
    }

    #[test]
    fn test_command_overflow_drops() {
        let mut host = host(HostConfig::default(), Arena::default());
        join(&mut host, addr(5, 7000), 0);
        for i in 0..64 {
            host.send_command(0, &format!("print {i}"), 10);
        }
        assert_eq!(host.participant(0).unwrap().state(), ParticipantState::Active);
        host.send_command(0, "print one too many", 10);
        let p = host.participant(0).unwrap();
        assert_eq!(p.state(), ParticipantState::Zombie);
        assert_eq!(
            p.reliable().pending().last().map(|(_, t)| t.to_owned()),
            Some("disconnect \"Host command overflow\"".to_owned())
        );
    }

    #[test]
    fn test_timeout_frees_slot() {
        let config = HostConfig {
            timeout_ms: 1000,
            ..HostConfig::default()
        };
        let mut host = host(config, Arena::default());
        join(&mut host, addr(6, 7000), 0);
        host.run_frame(500).unwrap();
        assert_eq!(host.participant(0).unwrap().state(), ParticipantState::Active);
        host.run_frame(1100).unwrap();
        assert_eq!(host.participant(0).unwrap().state(), ParticipantState::Free);
        assert!(host.simulation().saw("disconnect 0"));
    }

    #[test]
    fn test_configstring_while_primed_flushed_on_enter() {
        let mut host = host(HostConfig::default(), Arena::default());
        let from = addr(7, 7000);
        let mut peer = connect(&mut host, from, PROTOCOL_VERSION, 0).unwrap();
        peer.send(&mut host, 0, &[], 10);
        host.drain_outgoing();
        assert_eq!(host.participant(0).unwrap().state(), ParticipantState::Primed);

        host.set_configstring(20, "ctf", 15);
        assert!(host.participant(0).unwrap().reliable().pending().next().is_none());

        let host_id = host.host_id();
        peer.send(&mut host, host_id, &[cmd(50)], 20);
        let pending: Vec<String> = host
            .participant(0)
            .unwrap()
            .reliable()
            .pending()
            .map(|(_, t)| t.to_owned())
            .collect();
        assert_eq!(pending, vec!["cs 20 \"ctf\"".to_owned()]);
    }

    #[test]
    fn test_refused_by_simulation() {
        let sim = Arena {
            refuse: Some("Banned.".into()),
            ..Arena::default()
        };
        let mut host = host(HostConfig::default(), sim);
        let from = addr(8, 7000);
        assert!(connect(&mut host, from, PROTOCOL_VERSION, 0).is_none());
        assert_eq!(host.participant(0).unwrap().state(), ParticipantState::Free);
    }

    #[test]
    fn test_host_full() {
        let config = HostConfig {
            max_participants: 1,
            ..HostConfig::default()
        };
        let mut host = host(config, Arena::default());
        join(&mut host, addr(9, 7000), 0);

        let from = addr(10, 7000);
        host.process_packet(from, &OobMessage::GetChallenge { echo: None }.to_packet(), 5);
        let Some(OobMessage::ChallengeResponse { challenge, .. }) = oob_replies(&mut host, from).pop() else {
            panic!("no challenge");
        };
        let mut userinfo = UserInfo::new();
        userinfo.set("challenge", &challenge.to_string());
        userinfo.set("protocol", "71");
        userinfo.set("qport", "3");
        host.process_packet(from, &OobMessage::Connect { userinfo }.to_packet(), 5);
        assert_eq!(
            oob_replies(&mut host, from),
            vec![OobMessage::Print("Host is full.".into())]
        );
    }

    #[test]
    fn test_bots() {
        let mut host = host(HostConfig::default(), Arena::default());
        let mut info = UserInfo::new();
        info.set("name", "drone");
        let id = host.connect_bot(info, 0).unwrap();
        let p = host.participant(id).unwrap();
        assert!(p.is_bot());
        assert_eq!(p.state(), ParticipantState::Active);
        assert_eq!(p.name(), "drone");

        host.bot_think(id, &cmd(30));
        assert!(host.simulation().saw("think 0 30"));

        host.run_frame(50).unwrap();
        assert!(host.drain_outgoing().is_empty());

        host.kick(id, 60);
        assert_eq!(host.participant(id).unwrap().state(), ParticipantState::Free);
    }

    #[test]
    fn test_loopback_skips_challenge_and_pacing() {
        let mut host = host(HostConfig::default(), Arena::default());
        let from: SocketAddr = "127.0.0.1:27999".parse().unwrap();
        let mut userinfo = UserInfo::new();
        userinfo.set("protocol", "71");
        userinfo.set("qport", "8");
        userinfo.set("rate", "5000");
        host.process_packet(from, &OobMessage::Connect { userinfo }.to_packet(), 0);
        assert!(matches!(
            oob_replies(&mut host, from).as_slice(),
            [OobMessage::ConnectResponse { .. }]
        ));
        let p = host.participant(0).unwrap();
        assert_eq!(p.kind(), PeerKind::Loopback);
        assert_eq!(p.userinfo().get("ip"), Some("localhost"));
        assert_eq!(p.transport().unwrap().pacer().rate(), 0);
    }

    #[test]
    fn test_rate_clamped() {
        let config = HostConfig {
            min_rate: 5000,
            max_rate: 25000,
            ..HostConfig::default()
        };
        let mut host = host(config, Arena::default());
        let mut peer = join(&mut host, addr(11, 7000), 0);
        let host_id = host.host_id();
        peer.commands.push("userinfo \"name=x&rate=99999&snaps=100\"").unwrap();
        peer.send(&mut host, host_id, &[], 10);
        let p = host.participant(0).unwrap();
        assert_eq!(p.transport().unwrap().pacer().rate(), 25000);
        assert_eq!(p.snapshot_msec(), 50);
        assert_eq!(p.name(), "x");
    }
}
