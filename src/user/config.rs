//! Participant-side configuration.

use std::net::SocketAddr;

use rand::Rng;

use crate::admission::UserInfo;

/// How a [`UserConnection`](super::UserConnection) introduces itself.
#[derive(Debug, Clone)]
pub struct UserConfig {
    /// Host to connect to.
    pub host_addr: SocketAddr,
    /// Userinfo sent with `connect`; `challenge`, `protocol` and `qport`
    /// are filled in.
    pub userinfo: UserInfo,
    /// Port-independent channel id.
    pub qport: u16,
    /// Speak the legacy protocol version.
    pub legacy: bool,
    /// Interval between `getchallenge`/`connect` retries.
    pub resend_ms: u64,
}

impl UserConfig {
    /// Defaults for `host_addr` with a random qport.
    pub fn new(host_addr: SocketAddr) -> Self {
        Self {
            host_addr,
            userinfo: UserInfo::new(),
            qport: rand::thread_rng().r#gen(),
            legacy: false,
            resend_ms: 3000,
        }
    }
}

/// Builder for a [`UserConnection`](super::UserConnection).
#[derive(Debug)]
pub struct UserConnectionBuilder {
    config: UserConfig,
}

impl UserConnectionBuilder {
    /// Start a connection to `host_addr`.
    pub fn new(host_addr: SocketAddr) -> Self {
        Self {
            config: UserConfig::new(host_addr),
        }
    }

    /// Display name.
    pub fn name(self, name: &str) -> Self {
        self.userinfo("name", name)
    }

    /// Byte rate the host may send at.
    pub fn rate(self, rate: u32) -> Self {
        self.userinfo("rate", &rate.to_string())
    }

    /// Snapshots per second.
    pub fn snaps(self, snaps: u32) -> Self {
        self.userinfo("snaps", &snaps.to_string())
    }

    /// Any other userinfo key.
    pub fn userinfo(mut self, key: &str, value: &str) -> Self {
        self.config.userinfo.set(key, value);
        self
    }

    /// Fix the qport.
    pub fn qport(mut self, qport: u16) -> Self {
        self.config.qport = qport;
        self
    }

    /// Speak the legacy protocol.
    pub fn legacy(mut self, legacy: bool) -> Self {
        self.config.legacy = legacy;
        self
    }

    /// Handshake retry interval.
    pub fn resend_ms(mut self, ms: u64) -> Self {
        self.config.resend_ms = ms;
        self
    }

    /// The configuration.
    pub fn config(self) -> UserConfig {
        self.config
    }

    /// Create the connection; nothing is sent until
    /// [`connect`](super::UserConnection::connect).
    pub fn build(self) -> super::UserConnection {
        super::UserConnection::new(self.config)
    }
}
