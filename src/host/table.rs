//! Connection table and slot selection.

use std::net::{IpAddr, SocketAddr};

use super::participant::{Participant, ParticipantState};

/// Outcome of looking for a slot for a connect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotChoice {
    /// Same address and port connected too recently; retry after this many
    /// seconds.
    Cooldown(u64),
    /// Take over the live slot already bound to this peer.
    Reuse(usize),
    /// A free slot.
    Fresh(usize),
    /// Drop the bot in this slot and take it.
    EvictBot(usize),
    /// Nothing available.
    Full,
}

/// Parameters of a slot search.
#[derive(Debug, Clone, Copy)]
pub struct SlotRequest {
    /// Source address.
    pub from: SocketAddr,
    /// Announced qport.
    pub qport: u16,
    /// Carries the private-slot password.
    pub privileged: bool,
    /// Connecting over loopback.
    pub local: bool,
    /// Slots below this index need the password.
    pub private_slots: usize,
    /// Reconnect cooldown in milliseconds.
    pub reconnect_limit_ms: u64,
}

/// Fixed table of participant slots; the index is the participant id.
#[derive(Debug)]
pub struct ConnectionTable {
    slots: Vec<Participant>,
}

impl ConnectionTable {
    /// A table of `size` free slots.
    pub fn new(size: usize) -> Self {
        Self {
            slots: (0..size).map(Participant::new).collect(),
        }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True for a zero-sized table.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot `id`.
    pub fn get(&self, id: usize) -> Option<&Participant> {
        self.slots.get(id)
    }

    /// Slot `id`, mutably.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut Participant> {
        self.slots.get_mut(id)
    }

    /// All slots.
    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.slots.iter()
    }

    /// All slots, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Participant> {
        self.slots.iter_mut()
    }

    /// Slots that own a connection.
    pub fn occupied(&self) -> impl Iterator<Item = &Participant> {
        self.slots.iter().filter(|p| p.state != ParticipantState::Free)
    }

    /// Slot receiving sequenced packets from `from` with `qport`.
    ///
    /// Matches on IP and qport so a peer whose NAT changed its port is
    /// still found.
    pub fn find_sequenced(&self, from: SocketAddr, qport: u16) -> Option<usize> {
        self.slots
            .iter()
            .filter(|p| p.state != ParticipantState::Free)
            .find(|p| {
                p.transport.as_ref().is_some_and(|t| {
                    t.chan().remote().ip() == from.ip() && t.chan().qport() == qport
                })
            })
            .map(|p| p.id)
    }

    /// Live network connections from `ip` that are past their first
    /// message.
    pub fn connections_from(&self, ip: IpAddr) -> usize {
        self.slots
            .iter()
            .filter(|p| {
                !p.is_bot()
                    && p.state >= ParticipantState::Connected
                    && !p.just_connected
                    && p.address.is_some_and(|a| a.ip() == ip)
            })
            .count()
    }

    /// Pick a slot for a connect request.
    pub fn select_slot(&self, req: &SlotRequest, now: u64) -> SlotChoice {
        // Same address and port: enforce the reconnect cooldown.
        let candidate = self.slots.iter().find(|p| p.address == Some(req.from));
        if let Some(p) = candidate {
            let elapsed = now.saturating_sub(p.last_connect_time);
            if elapsed < req.reconnect_limit_ms {
                let remaining = (req.reconnect_limit_ms - elapsed).div_ceil(1000);
                return SlotChoice::Cooldown(remaining);
            }
        }

        let reconnect = self.slots.iter().find(|p| {
            p.state != ParticipantState::Free
                && !p.is_bot()
                && p.address.is_some_and(|a| a.ip() == req.from.ip())
                && (port_matches(p, req.from) || qport_matches(p, req.qport))
        });
        if let Some(p) = reconnect {
            return SlotChoice::Reuse(p.id);
        }

        let start = if req.privileged { 0 } else { req.private_slots };
        if let Some(p) = candidate.filter(|p| p.id >= start && p.state == ParticipantState::Free) {
            return SlotChoice::Fresh(p.id);
        }

        // Least recently disconnected free slot.
        let mut best: Option<&Participant> = None;
        for p in self.slots.iter().skip(start) {
            if p.state != ParticipantState::Free {
                continue;
            }
            if best.is_none_or(|b| p.last_disconnect_time < b.last_disconnect_time) {
                best = Some(p);
            }
        }
        if let Some(p) = best {
            return SlotChoice::Fresh(p.id);
        }

        let only_bots = self.slots.iter().skip(start).all(Participant::is_bot);
        if req.local && only_bots && self.slots.len() > start {
            return SlotChoice::EvictBot(self.slots.len() - 1);
        }
        SlotChoice::Full
    }
}

fn port_matches(p: &Participant, from: SocketAddr) -> bool {
    p.address.is_some_and(|a| a.port() == from.port())
}

fn qport_matches(p: &Participant, qport: u16) -> bool {
    p.transport.as_ref().is_some_and(|t| t.chan().qport() == qport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::participant::PeerKind;
    use crate::transport::{ChannelSide, Netchan, RatePacer, TransportQueue};

    fn addr(port: u16) -> SocketAddr {
        format!("10.1.1.1:{port}").parse().unwrap()
    }

    fn request(from: SocketAddr) -> SlotRequest {
        SlotRequest {
            from,
            qport: 77,
            privileged: false,
            local: false,
            private_slots: 0,
            reconnect_limit_ms: 3000,
        }
    }

    fn occupy(table: &mut ConnectionTable, id: usize, from: SocketAddr, qport: u16) {
        let p = table.get_mut(id).unwrap();
        p.state = ParticipantState::Active;
        p.address = Some(from);
        p.transport = Some(TransportQueue::new(
            Netchan::new(ChannelSide::Host, from, qport, 1, false),
            RatePacer::unlimited(),
        ));
    }

    #[test]
    fn test_fresh_picks_least_recently_disconnected() {
        let mut table = ConnectionTable::new(3);
        table.get_mut(0).unwrap().last_disconnect_time = 900;
        table.get_mut(1).unwrap().last_disconnect_time = 100;
        table.get_mut(2).unwrap().last_disconnect_time = 500;
        assert_eq!(table.select_slot(&request(addr(1)), 10_000), SlotChoice::Fresh(1));
    }

    #[test]
    fn test_cooldown() {
        let mut table = ConnectionTable::new(2);
        let p = table.get_mut(0).unwrap();
        p.address = Some(addr(5));
        p.last_connect_time = 10_000;
        assert_eq!(
            table.select_slot(&request(addr(5)), 10_500),
            SlotChoice::Cooldown(3)
        );
        assert_eq!(
            table.select_slot(&request(addr(5)), 13_000),
            SlotChoice::Fresh(0)
        );
    }

    #[test]
    fn test_reuse_same_qport_after_port_change() {
        let mut table = ConnectionTable::new(2);
        occupy(&mut table, 1, addr(5), 77);
        assert_eq!(
            table.select_slot(&request(addr(6)), 100_000),
            SlotChoice::Reuse(1)
        );
        assert_eq!(table.find_sequenced(addr(6), 77), Some(1));
        assert_eq!(table.find_sequenced(addr(6), 78), None);
    }

    #[test]
    fn test_private_slots() {
        let table = ConnectionTable::new(3);
        let mut req = request(addr(1));
        req.private_slots = 2;
        assert_eq!(table.select_slot(&req, 0), SlotChoice::Fresh(2));
        req.privileged = true;
        assert_eq!(table.select_slot(&req, 0), SlotChoice::Fresh(0));
    }

    #[test]
    fn test_full_and_bot_eviction() {
        let mut table = ConnectionTable::new(2);
        for id in 0..2 {
            let p = table.get_mut(id).unwrap();
            p.state = ParticipantState::Active;
            p.kind = PeerKind::Bot;
        }
        let mut req = request(addr(1));
        assert_eq!(table.select_slot(&req, 0), SlotChoice::Full);
        req.local = true;
        assert_eq!(table.select_slot(&req, 0), SlotChoice::EvictBot(1));

        occupy(&mut table, 0, addr(9), 1);
        table.get_mut(0).unwrap().kind = PeerKind::Remote;
        assert_eq!(table.select_slot(&req, 0), SlotChoice::Full);
    }

    #[test]
    fn test_connections_from_ip() {
        let mut table = ConnectionTable::new(3);
        occupy(&mut table, 0, addr(1), 1);
        occupy(&mut table, 1, addr(2), 2);
        table.get_mut(1).unwrap().just_connected = true;
        assert_eq!(table.connections_from(addr(3).ip()), 1);
    }
}
