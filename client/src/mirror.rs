//! Client-side copy of the player's profile
//!
//! The server sends one full snapshot at login (and on request), then only
//! incremental updates. Applying them in arrival order keeps the mirror equal
//! to the server's profile as of the last push.

use log::{debug, warn};
use shared::{op_codes, player, DecodeError, Profile, SchemaMode};

pub struct ProfileMirror {
    profile: Option<Profile>,
    snapshots: u32,
    updates: u32,
}

impl ProfileMirror {
    pub fn new() -> Self {
        Self {
            profile: None,
            snapshots: 0,
            updates: 0,
        }
    }

    /// The mirrored profile, once a snapshot arrived
    pub fn profile(&self) -> Option<&Profile> {
        self.profile.as_ref()
    }

    /// Number of snapshots applied
    pub fn snapshots(&self) -> u32 {
        self.snapshots
    }

    /// Number of incremental updates applied
    pub fn updates(&self) -> u32 {
        self.updates
    }

    /// Replaces the mirror with a full snapshot
    pub fn apply_snapshot(&mut self, owner_id: &str, payload: &[u8]) -> Result<(), DecodeError> {
        let mut profile = player::new_profile(owner_id);
        profile.restore_full(payload, SchemaMode::Strict)?;
        self.profile = Some(profile);
        self.snapshots += 1;
        debug!("Applied snapshot ({} bytes)", payload.len());
        Ok(())
    }

    /// Applies an incremental update; ignored until a snapshot arrived
    pub fn apply_update(&mut self, payload: &[u8]) -> Result<(), DecodeError> {
        let Some(profile) = self.profile.as_mut() else {
            warn!("Update received before any snapshot, ignoring");
            return Ok(());
        };
        profile.apply_updates(payload)?;
        self.updates += 1;
        debug!("Applied update ({} bytes)", payload.len());
        Ok(())
    }

    /// Routes a server push by op code; returns false for op codes it does not handle
    pub fn handle_message(
        &mut self,
        owner_id: &str,
        op_code: u16,
        payload: &[u8],
    ) -> Result<bool, DecodeError> {
        match op_code {
            op_codes::PROFILE_SNAPSHOT => self.apply_snapshot(owner_id, payload)?,
            op_codes::PROFILE_UPDATE => self.apply_update(payload)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// One-line summary for logs
    pub fn summary(&self) -> String {
        let Some(profile) = &self.profile else {
            return "no profile yet".to_string();
        };

        let name = profile
            .value::<String>(player::DISPLAY_NAME)
            .map(String::as_str)
            .unwrap_or("?");
        let level = profile.value::<i32>(player::LEVEL).copied().unwrap_or_default();
        let experience = profile
            .value::<i64>(player::EXPERIENCE)
            .copied()
            .unwrap_or_default();
        let gold = profile.value::<i64>(player::GOLD).copied().unwrap_or_default();
        let inventory = profile
            .list::<String>(player::INVENTORY)
            .map(|items| items.join(", "))
            .unwrap_or_default();

        format!(
            "{} (level {}, {} xp, {} gold) inventory: [{}]",
            name, level, experience, gold, inventory
        )
    }
}

impl Default for ProfileMirror {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_then_updates() {
        let mut server_side = player::new_profile("dana");
        server_side.set_value(player::GOLD, 250i64).unwrap();

        let mut mirror = ProfileMirror::new();
        assert!(mirror.profile().is_none());

        mirror
            .handle_message("dana", op_codes::PROFILE_SNAPSHOT, &server_side.serialize_full())
            .unwrap();
        server_side.clear_updates();

        server_side
            .edit_list::<String, _>(player::INVENTORY, |items| items.push("lamp".into()))
            .unwrap();
        server_side.set_value(player::GOLD, 200i64).unwrap();
        mirror
            .handle_message("dana", op_codes::PROFILE_UPDATE, &server_side.get_updates())
            .unwrap();

        assert_eq!(mirror.profile(), Some(&server_side));
        assert_eq!(mirror.snapshots(), 1);
        assert_eq!(mirror.updates(), 1);
        assert!(mirror.summary().contains("200 gold"));
        assert!(mirror.summary().contains("lamp"));
    }

    #[test]
    fn test_update_before_snapshot_is_ignored() {
        let mut server_side = player::new_profile("dana");
        server_side.set_value(player::LEVEL, 2i32).unwrap();

        let mut mirror = ProfileMirror::new();
        mirror.apply_update(&server_side.get_updates()).unwrap();
        assert!(mirror.profile().is_none());
        assert_eq!(mirror.updates(), 0);
    }

    #[test]
    fn test_unknown_op_code_is_not_handled() {
        let mut mirror = ProfileMirror::new();
        assert!(!mirror.handle_message("dana", 999, &[]).unwrap());
    }

    #[test]
    fn test_corrupt_snapshot_keeps_previous_mirror() {
        let server_side = player::new_profile("dana");
        let mut mirror = ProfileMirror::new();
        mirror.apply_snapshot("dana", &server_side.serialize_full()).unwrap();

        assert!(mirror.apply_snapshot("dana", &[0, 0, 0, 9]).is_err());
        assert_eq!(mirror.profile(), Some(&server_side));
    }
}
