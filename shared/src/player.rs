//! Player profile schema shared by server and client
//!
//! Both ends build profiles through [`new_profile`] so that property keys,
//! types and count always agree.

use crate::profile::Profile;

pub const DISPLAY_NAME: u16 = 0;
pub const LEVEL: u16 = 1;
pub const EXPERIENCE: u16 = 2;
pub const GOLD: u16 = 3;
pub const INVENTORY: u16 = 4;
pub const ACHIEVEMENTS: u16 = 5;

pub const STARTING_GOLD: i64 = 100;
pub const MAX_DISPLAY_NAME_LEN: usize = 24;
pub const MAX_INVENTORY_SIZE: usize = 64;
pub const MAX_ITEM_NAME_LEN: usize = 32;
pub const MAX_LEVEL: i32 = 100;
/// Largest experience award a single request may carry
pub const MAX_EXPERIENCE_GAIN: i64 = 1_000_000;

/// Builds a profile with every player property at its default value
pub fn new_profile(owner_id: &str) -> Profile {
    Profile::builder(owner_id)
        .value(DISPLAY_NAME, owner_id.to_string())
        .value(LEVEL, 1i32)
        .value(EXPERIENCE, 0i64)
        .value(GOLD, STARTING_GOLD)
        .list::<String>(INVENTORY)
        .list::<String>(ACHIEVEMENTS)
        .build()
        .unwrap_or_else(|err| unreachable!("player schema is static: {err}"))
}

/// Experience needed to go from `level` to `level + 1`
pub fn experience_for_level(level: i32) -> i64 {
    100 * i64::from(level.max(1))
}
