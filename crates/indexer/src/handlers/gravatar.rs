use serde::{Deserialize, Serialize};
use serde_json::Value;

use loom_common::error::IndexerError;
use loom_common::types::DecodedEvent;
use loom_engine::runtime::{EventHandler, HandlerContext, HandlerRegistry, LoaderContext};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Gravatar {
    id: String,
    owner: String,
    display_name: String,
    image_url: String,
    updates_count: i64,
}

impl Gravatar {
    fn from_params(params: &Value, updates_count: i64) -> Self {
        Self {
            id: params["id"].as_str().unwrap_or_default().to_string(),
            owner: params["owner"].as_str().unwrap_or_default().to_string(),
            display_name: params["displayName"].as_str().unwrap_or_default().to_string(),
            image_url: params["imageUrl"].as_str().unwrap_or_default().to_string(),
            updates_count,
        }
    }

    fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("gravatar serializes")
    }
}

struct NewGravatarHandler;

impl EventHandler for NewGravatarHandler {
    fn handle(
        &self,
        event: &DecodedEvent,
        ctx: &mut HandlerContext<'_>,
    ) -> Result<(), IndexerError> {
        let gravatar = Gravatar::from_params(&event.params, 1);
        let id = gravatar.id.clone();
        ctx.insert("Gravatar", &id, gravatar.to_value());
        Ok(())
    }
}

struct UpdatedGravatarHandler;

impl EventHandler for UpdatedGravatarHandler {
    fn register_loads(&self, event: &DecodedEvent, loader: &mut LoaderContext) {
        if let Some(id) = event.params["id"].as_str() {
            loader.load("Gravatar", id);
        }
    }

    fn handle(
        &self,
        event: &DecodedEvent,
        ctx: &mut HandlerContext<'_>,
    ) -> Result<(), IndexerError> {
        let id = event.params["id"].as_str().unwrap_or_default();
        match ctx.get_as::<Gravatar>("Gravatar", id) {
            Some(current) => {
                let updated = Gravatar::from_params(&event.params, current.updates_count + 1);
                ctx.update("Gravatar", id, updated.to_value());
            }
            None => {
                // First sighting of this gravatar; treat the update as its
                // creation.
                let created = Gravatar::from_params(&event.params, 1);
                ctx.insert("Gravatar", id, created.to_value());
            }
        }
        Ok(())
    }
}

pub fn register(handlers: &mut HandlerRegistry) {
    handlers.register("Gravatar", "NewGravatar", Box::new(NewGravatarHandler));
    handlers.register("Gravatar", "UpdatedGravatar", Box::new(UpdatedGravatarHandler));
}
