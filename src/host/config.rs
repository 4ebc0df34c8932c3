//! Host configuration.

use serde::{Deserialize, Serialize};

use crate::core::{DEFAULT_SNAPSHOT_ENTITIES, HostError, MAX_ENTITIES, MAX_PARTICIPANTS, MAX_SNAPSHOT_ENTITIES};
use crate::transport::pacing_constants;

/// Tunables loaded by the surrounding application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Size of the connection table.
    pub max_participants: usize,

    /// Leading slots reserved for connections carrying `private_password`.
    pub private_slots: usize,

    /// Password unlocking the reserved slots.
    pub private_password: Option<String>,

    /// Simultaneous connections allowed from one IP address.
    pub max_per_address: usize,

    /// Lowest byte rate a participant may announce; 0 disables the bound.
    pub min_rate: u32,

    /// Highest byte rate a participant may announce; 0 disables the bound.
    pub max_rate: u32,

    /// Byte rate used when a participant announces none.
    pub default_rate: u32,

    /// Simulation ticks per second, and the highest snapshot rate.
    pub snapshot_rate: u32,

    /// Rate-limit non-builtin commands from active participants.
    pub flood_protect: bool,

    /// Seconds before the same address and port may connect again.
    pub reconnect_limit_secs: u64,

    /// How long a dropped participant's slot stays reserved.
    pub zombie_linger_ms: u64,

    /// Silence after which a participant is dropped.
    pub timeout_ms: u64,

    /// Require a valid asset acknowledgment (`cp`) before entering the world.
    pub require_asset_ack: bool,

    /// Serve file downloads.
    pub allow_download: bool,

    /// Files participants may download.
    pub download_references: Vec<String>,

    /// Referenced files that are never served.
    pub protected_downloads: Vec<String>,

    /// Entity states held by the shared snapshot arena.
    pub snapshot_entities: usize,

    /// Entities sent to one participant per snapshot.
    pub max_visible_entities: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_participants: 8,
            private_slots: 0,
            private_password: None,
            max_per_address: 3,
            min_rate: pacing_constants::MIN_RATE,
            max_rate: pacing_constants::MAX_RATE,
            default_rate: pacing_constants::DEFAULT_RATE,
            snapshot_rate: 20,
            flood_protect: true,
            reconnect_limit_secs: 3,
            zombie_linger_ms: 2_000,
            timeout_ms: 200_000,
            require_asset_ack: false,
            allow_download: false,
            download_references: Vec::new(),
            protected_downloads: Vec::new(),
            snapshot_entities: DEFAULT_SNAPSHOT_ENTITIES,
            max_visible_entities: MAX_SNAPSHOT_ENTITIES,
        }
    }
}

impl HostConfig {
    /// Check the values are usable together.
    pub fn validate(&self) -> Result<(), HostError> {
        let fail = |msg: String| Err(HostError::Config(msg));
        if !(1..=MAX_PARTICIPANTS).contains(&self.max_participants) {
            return fail(format!(
                "max_participants {} out of 1..={MAX_PARTICIPANTS}",
                self.max_participants
            ));
        }
        if self.private_slots >= self.max_participants {
            return fail(format!(
                "private_slots ({}) leaves no public slot out of {}",
                self.private_slots, self.max_participants
            ));
        }
        if self.min_rate != 0 && self.max_rate != 0 && self.min_rate > self.max_rate {
            return fail(format!(
                "min_rate {} exceeds max_rate {}",
                self.min_rate, self.max_rate
            ));
        }
        if !(1..=1000).contains(&self.snapshot_rate) {
            return fail(format!("snapshot_rate {} out of 1..=1000", self.snapshot_rate));
        }
        if self.snapshot_entities < MAX_ENTITIES {
            return fail(format!(
                "snapshot_entities {} cannot hold one full tick of {MAX_ENTITIES}",
                self.snapshot_entities
            ));
        }
        if self.max_visible_entities == 0 || self.max_visible_entities > MAX_SNAPSHOT_ENTITIES {
            return fail(format!(
                "max_visible_entities {} out of 1..={MAX_SNAPSHOT_ENTITIES}",
                self.max_visible_entities
            ));
        }
        Ok(())
    }

    /// Milliseconds between simulation ticks.
    pub fn frame_msec(&self) -> u64 {
        1000 / u64::from(self.snapshot_rate.max(1))
    }
}

/// Builder for [`HostConfig`].
#[derive(Debug, Default)]
pub struct HostConfigBuilder {
    config: HostConfig,
}

impl HostConfigBuilder {
    /// Start from the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection table size.
    pub fn max_participants(mut self, max: usize) -> Self {
        self.config.max_participants = max;
        self
    }

    /// Reserve the first `count` slots for `password`.
    pub fn private_slots(mut self, count: usize, password: impl Into<String>) -> Self {
        self.config.private_slots = count;
        self.config.private_password = Some(password.into());
        self
    }

    /// Set the per-address connection cap.
    pub fn max_per_address(mut self, max: usize) -> Self {
        self.config.max_per_address = max;
        self
    }

    /// Set the accepted byte-rate range.
    pub fn rate_bounds(mut self, min: u32, max: u32) -> Self {
        self.config.min_rate = min;
        self.config.max_rate = max;
        self
    }

    /// Set the byte rate for participants that announce none.
    pub fn default_rate(mut self, rate: u32) -> Self {
        self.config.default_rate = rate;
        self
    }

    /// Set the tick and maximum snapshot rate.
    pub fn snapshot_rate(mut self, hz: u32) -> Self {
        self.config.snapshot_rate = hz;
        self
    }

    /// Enable or disable command flood protection.
    pub fn flood_protect(mut self, enabled: bool) -> Self {
        self.config.flood_protect = enabled;
        self
    }

    /// Set the reconnect cooldown.
    pub fn reconnect_limit_secs(mut self, secs: u64) -> Self {
        self.config.reconnect_limit_secs = secs;
        self
    }

    /// Set how long dropped slots linger.
    pub fn zombie_linger_ms(mut self, ms: u64) -> Self {
        self.config.zombie_linger_ms = ms;
        self
    }

    /// Set the silence timeout.
    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.config.timeout_ms = ms;
        self
    }

    /// Require asset acknowledgment before entering the world.
    pub fn require_asset_ack(mut self, enabled: bool) -> Self {
        self.config.require_asset_ack = enabled;
        self
    }

    /// Serve downloads of the listed files.
    pub fn downloads<I, S>(mut self, references: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.allow_download = true;
        self.config.download_references = references.into_iter().map(Into::into).collect();
        self
    }

    /// Never serve the listed files.
    pub fn protected_downloads<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.protected_downloads = names.into_iter().map(Into::into).collect();
        self
    }

    /// Set the snapshot arena size.
    pub fn snapshot_entities(mut self, count: usize) -> Self {
        self.config.snapshot_entities = count;
        self
    }

    /// Set the per-snapshot entity cap.
    pub fn max_visible_entities(mut self, count: usize) -> Self {
        self.config.max_visible_entities = count;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<HostConfig, HostError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
