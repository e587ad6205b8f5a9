//! Admin grants against another player's profile
//!
//! Item grants go through the inventory module when it is available; without
//! it they answer [`Status::Default`](shared::Status::Default).

use std::sync::{Arc, OnceLock};

use log::info;
use shared::{codec, op_codes, player, Decode, Reader};

use crate::modules::auth::{self, AuthModule};
use crate::modules::inventory::InventoryModule;
use crate::modules::profiles::ProfilesModule;
use crate::registry::{Dependency, DependencyError, InitContext, Module};
use crate::router::{HandlerError, HandlerResult, Request};

struct Deps {
    profiles: Arc<ProfilesModule>,
    inventory: Option<Arc<InventoryModule>>,
}

#[derive(Default)]
pub struct AdminModule {
    deps: OnceLock<Deps>,
}

impl AdminModule {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn deps(&self) -> Result<&Deps, HandlerError> {
        self.deps
            .get()
            .ok_or_else(|| HandlerError::Internal("admin used before initialization".into()))
    }

    async fn grant_gold(self: Arc<Self>, request: Request) -> HandlerResult {
        let admin = auth::admin_session(&request)?;
        let (target, amount): (String, i64) = decode_grant(&request.payload)?;
        if amount <= 0 {
            return Err(HandlerError::Failed("amount must be positive".into()));
        }

        let gold = self
            .deps()?
            .profiles
            .mutate(&target, |profile| -> Result<i64, HandlerError> {
                let gold = profile.value::<i64>(player::GOLD)?.saturating_add(amount);
                profile.set_value(player::GOLD, gold)?;
                Ok(gold)
            })
            .await
            .unwrap_or_else(|| Err(HandlerError::NotFound(format!("{} is not online", target))))?;

        info!("{} granted {} gold to {}", admin.user_id, amount, target);
        Ok(codec::to_bytes(&gold))
    }

    async fn grant_item(self: Arc<Self>, request: Request) -> HandlerResult {
        let admin = auth::admin_session(&request)?;
        let (target, item): (String, String) = decode_grant(&request.payload)?;

        let Some(inventory) = &self.deps()?.inventory else {
            return Err(HandlerError::NotFound("item grants are unavailable".into()));
        };
        let count = inventory.grant_item(&target, item.clone()).await?;

        info!("{} granted {} to {}", admin.user_id, item, target);
        Ok(codec::to_bytes(&(count as i32)))
    }
}

/// Reads a `(target user, value)` pair
fn decode_grant<T: Decode>(payload: &[u8]) -> Result<(String, T), HandlerError> {
    let mut reader = Reader::new(payload);
    let target = String::decode(&mut reader)?;
    let value = T::decode(&mut reader)?;
    reader.finish()?;
    Ok((target, value))
}

impl Module for AdminModule {
    fn name(&self) -> &'static str {
        "admin"
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![
            Dependency::required::<AuthModule>(),
            Dependency::required::<ProfilesModule>(),
            Dependency::optional::<InventoryModule>(),
        ]
    }

    fn initialize(self: Arc<Self>, ctx: &mut InitContext<'_>) -> Result<(), DependencyError> {
        let deps = Deps {
            profiles: ctx.require::<ProfilesModule>()?,
            inventory: ctx.get::<InventoryModule>(),
        };
        if deps.inventory.is_none() {
            info!("Inventory module not available, item grants disabled");
        }
        let _ = self.deps.set(deps);

        let module = Arc::clone(&self);
        ctx.router()
            .register_handler(op_codes::ADMIN_GRANT_GOLD, move |request| {
                Arc::clone(&module).grant_gold(request)
            });
        let module = Arc::clone(&self);
        ctx.router()
            .register_handler(op_codes::ADMIN_GRANT_ITEM, move |request| {
                Arc::clone(&module).grant_item(request)
            });
        Ok(())
    }
}
