//! Gameplay requests that change the caller's own profile

use std::sync::{Arc, OnceLock};

use log::debug;
use shared::{codec, op_codes, player, Profile};

use crate::modules::profiles::ProfilesModule;
use crate::registry::{Dependency, DependencyError, InitContext, Module};
use crate::router::{HandlerError, HandlerResult, Request};

#[derive(Default)]
pub struct InventoryModule {
    profiles: OnceLock<Arc<ProfilesModule>>,
}

impl InventoryModule {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn profiles(&self) -> Result<&Arc<ProfilesModule>, HandlerError> {
        self.profiles
            .get()
            .ok_or_else(|| HandlerError::Internal("inventory used before initialization".into()))
    }

    /// Adds `item` to the inventory of an active profile
    pub async fn grant_item(&self, owner_id: &str, item: String) -> Result<usize, HandlerError> {
        self.profiles()?
            .mutate(owner_id, |profile| add_item(profile, item))
            .await
            .unwrap_or_else(|| Err(HandlerError::NotFound(format!("{} is not online", owner_id))))
    }

    async fn handle(self: Arc<Self>, request: Request) -> HandlerResult {
        let profiles = self.profiles()?;
        match request.op_code {
            op_codes::SET_DISPLAY_NAME => {
                let name: String = request.decode()?;
                let name = validate_display_name(&name)?;
                profiles
                    .mutate_for(&request, |profile| {
                        profile.set_value(player::DISPLAY_NAME, name.clone())?;
                        Ok(codec::to_bytes(&name))
                    })
                    .await
            }
            op_codes::ADD_ITEM => {
                let item: String = request.decode()?;
                let count = profiles
                    .mutate_for(&request, |profile| add_item(profile, item))
                    .await?;
                Ok(codec::to_bytes(&(count as i32)))
            }
            op_codes::REMOVE_ITEM => {
                let item: String = request.decode()?;
                profiles
                    .mutate_for(&request, |profile| {
                        let removed = profile.edit_list::<String, _>(player::INVENTORY, |items| {
                            items.position(&item).map(|index| items.remove(index))
                        })?;
                        match removed {
                            Some(Ok(_)) => Ok(Vec::new()),
                            Some(Err(err)) => Err(HandlerError::Internal(err.to_string())),
                            None => Err(HandlerError::NotFound(format!("no {} in inventory", item))),
                        }
                    })
                    .await
            }
            op_codes::SPEND_GOLD => {
                let amount: i64 = request.decode()?;
                if amount <= 0 {
                    return Err(HandlerError::Failed("amount must be positive".into()));
                }
                profiles
                    .mutate_for(&request, |profile| {
                        let gold = *profile.value::<i64>(player::GOLD)?;
                        if gold < amount {
                            return Err(HandlerError::Failed("not enough gold".into()));
                        }
                        profile.set_value(player::GOLD, gold - amount)?;
                        Ok(codec::to_bytes(&(gold - amount)))
                    })
                    .await
            }
            op_codes::GAIN_EXPERIENCE => {
                let amount: i64 = request.decode()?;
                if amount <= 0 {
                    return Err(HandlerError::Failed("amount must be positive".into()));
                }
                profiles
                    .mutate_for(&request, |profile| {
                        let level = gain_experience(profile, amount)?;
                        Ok(codec::to_bytes(&level))
                    })
                    .await
            }
            other => Err(HandlerError::NotFound(format!("unknown op code {}", other))),
        }
    }
}

fn validate_display_name(name: &str) -> Result<String, HandlerError> {
    let name = name.trim();
    let length = name.chars().count();
    if length == 0 || length > player::MAX_DISPLAY_NAME_LEN {
        return Err(HandlerError::Failed(format!(
            "display name must be 1 to {} characters",
            player::MAX_DISPLAY_NAME_LEN
        )));
    }
    Ok(name.to_string())
}

/// Appends `item`, returning the new inventory size
fn add_item(profile: &mut Profile, item: String) -> Result<usize, HandlerError> {
    let item = item.trim().to_string();
    if item.is_empty() || item.chars().count() > player::MAX_ITEM_NAME_LEN {
        return Err(HandlerError::Failed(format!(
            "item name must be 1 to {} characters",
            player::MAX_ITEM_NAME_LEN
        )));
    }
    if profile.list::<String>(player::INVENTORY)?.len() >= player::MAX_INVENTORY_SIZE {
        return Err(HandlerError::Failed("inventory is full".into()));
    }
    Ok(profile.edit_list::<String, _>(player::INVENTORY, |items| {
        items.push(item);
        items.len()
    })?)
}

/// Adds experience and levels up as often as it covers; returns the level
/// Adds experience and levels up; stops at [`player::MAX_LEVEL`]
fn gain_experience(profile: &mut Profile, amount: i64) -> Result<i32, HandlerError> {
    if amount > player::MAX_EXPERIENCE_GAIN {
        return Err(HandlerError::Failed(format!(
            "at most {} experience per request",
            player::MAX_EXPERIENCE_GAIN
        )));
    }

    let mut level = *profile.value::<i32>(player::LEVEL)?;
    let mut experience = profile.value::<i64>(player::EXPERIENCE)?.saturating_add(amount);
    let start_level = level;

    while level < player::MAX_LEVEL && experience >= player::experience_for_level(level) {
        experience -= player::experience_for_level(level);
        level += 1;
        if level % 5 == 0 {
            let achievement = format!("reached-level-{}", level);
            profile.edit_list::<String, _>(player::ACHIEVEMENTS, |list| {
                if !list.contains(&achievement) {
                    list.push(achievement);
                }
            })?;
        }
    }

    if level >= player::MAX_LEVEL {
        experience = experience.min(player::experience_for_level(level) - 1);
    }

    profile.set_value(player::EXPERIENCE, experience)?;
    if level != start_level {
        debug!("{} reached level {}", profile.owner_id(), level);
        profile.set_value(player::LEVEL, level)?;
    }
    Ok(level)
}

impl Module for InventoryModule {
    fn name(&self) -> &'static str {
        "inventory"
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![Dependency::required::<ProfilesModule>()]
    }

    fn initialize(self: Arc<Self>, ctx: &mut InitContext<'_>) -> Result<(), DependencyError> {
        let profiles = ctx.require::<ProfilesModule>()?;
        let _ = self.profiles.set(profiles);

        for op_code in [
            op_codes::SET_DISPLAY_NAME,
            op_codes::ADD_ITEM,
            op_codes::REMOVE_ITEM,
            op_codes::SPEND_GOLD,
            op_codes::GAIN_EXPERIENCE,
        ] {
            let module = Arc::clone(&self);
            ctx.router().register_handler(op_code, move |request| {
                Arc::clone(&module).handle(request)
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_item_limits() {
        let mut profile = player::new_profile("alice");
        assert_eq!(add_item(&mut profile, " bow ".into()).unwrap(), 1);
        assert_eq!(profile.list::<String>(player::INVENTORY).unwrap(), &["bow".to_string()]);
        assert!(matches!(
            add_item(&mut profile, "  ".into()),
            Err(HandlerError::Failed(_))
        ));

        for i in 1..player::MAX_INVENTORY_SIZE {
            add_item(&mut profile, format!("item-{}", i)).unwrap();
        }
        assert!(matches!(
            add_item(&mut profile, "one-too-many".into()),
            Err(HandlerError::Failed(_))
        ));
    }

    #[test]
    fn test_gain_experience_levels_up() {
        let mut profile = player::new_profile("alice");

        assert_eq!(gain_experience(&mut profile, 50).unwrap(), 1);
        assert!(!profile.dirty_keys().contains(&player::LEVEL));

        // 50 + 1000 covers levels 1..=4 (100+200+300+400) with 50 left over
        assert_eq!(gain_experience(&mut profile, 1000).unwrap(), 5);
        assert_eq!(*profile.value::<i64>(player::EXPERIENCE).unwrap(), 50);
        assert_eq!(
            profile.list::<String>(player::ACHIEVEMENTS).unwrap(),
            &["reached-level-5".to_string()]
        );
    }

    #[test]
    fn test_gain_experience_is_bounded() {
        let mut profile = player::new_profile("alice");
        assert!(matches!(
            gain_experience(&mut profile, i64::MAX),
            Err(HandlerError::Failed(_))
        ));
        assert_eq!(*profile.value::<i32>(player::LEVEL).unwrap(), 1);

        for _ in 0..1_000 {
            gain_experience(&mut profile, player::MAX_EXPERIENCE_GAIN).unwrap();
        }
        assert_eq!(*profile.value::<i32>(player::LEVEL).unwrap(), player::MAX_LEVEL);
        assert!(
            *profile.value::<i64>(player::EXPERIENCE).unwrap()
                < player::experience_for_level(player::MAX_LEVEL)
        );
        assert_eq!(profile.list::<String>(player::ACHIEVEMENTS).unwrap().len(), 20);
        assert!(profile.serialize_full().len() < shared::MAX_DATAGRAM);
    }

    #[test]
    fn test_display_name_validation() {
        assert_eq!(validate_display_name("  Ann ").unwrap(), "Ann");
        assert!(validate_display_name("   ").is_err());
        assert!(validate_display_name(&"n".repeat(player::MAX_DISPLAY_NAME_LEN + 1)).is_err());
    }
}
