//! Collaborators the host drives but does not own.

use crate::admission::UserInfo;
use crate::snapshot::{SharedEntity, VisibilityMap};
use crate::sync::{PlayerState, UserCmd};

/// The authoritative simulation.
///
/// Participant ids are slot indices and double as entity ids.
pub trait Simulation {
    /// A participant was admitted. An error refuses the connection with
    /// the returned text.
    fn participant_connect(&mut self, id: usize, first_time: bool, is_bot: bool) -> Result<(), String> {
        let _ = (id, first_time, is_bot);
        Ok(())
    }

    /// The participant entered the world.
    fn participant_begin(&mut self, id: usize) {
        let _ = id;
    }

    /// The participant left.
    fn participant_disconnect(&mut self, id: usize) {
        let _ = id;
    }

    /// A reliable command the host does not handle itself.
    fn participant_command(&mut self, id: usize, args: &[String]) {
        let _ = (id, args);
    }

    /// One input command, in order, never repeated.
    fn participant_think(&mut self, id: usize, cmd: &UserCmd) {
        let _ = (id, cmd);
    }

    /// The participant's userinfo changed.
    fn participant_userinfo_changed(&mut self, id: usize, info: &UserInfo) {
        let _ = (id, info);
    }

    /// Advance to `time` (milliseconds since world load).
    fn run_frame(&mut self, time: u32) {
        let _ = time;
    }

    /// Entity slots, indexed by entity id.
    fn entities(&self) -> &[SharedEntity];

    /// Current player state of a participant.
    fn player_state(&self, id: usize) -> PlayerState;

    /// Spatial visibility of the loaded world.
    fn visibility(&self) -> &dyn VisibilityMap;
}

/// Validates the asset checksums sent with `cp`.
pub trait AssetVerifier {
    /// True if `checksums` match the loaded assets under `checksum_feed`.
    fn verify(&self, checksum_feed: i32, checksums: &[i32]) -> bool;
}

/// Accepts any acknowledgment.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllAssets;

impl AssetVerifier for AcceptAllAssets {
    fn verify(&self, _checksum_feed: i32, _checksums: &[i32]) -> bool {
        true
    }
}
