use serde_json::json;

use loom_common::error::IndexerError;
use loom_common::types::DecodedEvent;
use loom_engine::runtime::{EventHandler, HandlerContext, HandlerRegistry, LoaderContext};

struct NftCreatedHandler;

impl EventHandler for NftCreatedHandler {
    fn handle(
        &self,
        event: &DecodedEvent,
        ctx: &mut HandlerContext<'_>,
    ) -> Result<(), IndexerError> {
        let nft = event.params["nft"].as_str().unwrap_or_default();
        let creator = event.params["creator"].as_str().unwrap_or_default();

        // The fresh collection becomes a fetch target; blocks between its
        // deployment and the chain's current fetch position are
        // back-filled through the auxiliary queue.
        ctx.register_contract("Nft", nft);
        ctx.insert(
            "NftCollection",
            nft,
            json!({"id": nft, "creator": creator, "minted": 0}),
        );
        Ok(())
    }
}

struct MintedHandler;

impl EventHandler for MintedHandler {
    fn register_loads(&self, event: &DecodedEvent, loader: &mut LoaderContext) {
        loader.load("NftCollection", &event.contract_address);
    }

    fn handle(
        &self,
        event: &DecodedEvent,
        ctx: &mut HandlerContext<'_>,
    ) -> Result<(), IndexerError> {
        let collection = event.contract_address.as_str();
        let owner = event.params["to"].as_str().unwrap_or_default();
        let token_id = event.params["tokenId"].as_str().unwrap_or_default();

        let nft_id = format!("{collection}-{token_id}");
        let record = json!({
            "id": nft_id.clone(),
            "collection": collection,
            "owner": owner,
            "tokenId": token_id,
        });
        ctx.insert("Nft", &nft_id, record);

        if let Some(mut record) = ctx.get("NftCollection", collection) {
            let minted = record["minted"].as_i64().unwrap_or(0) + 1;
            record["minted"] = json!(minted);
            ctx.update("NftCollection", collection, record);
        }
        Ok(())
    }
}

pub fn register(handlers: &mut HandlerRegistry) {
    handlers.register("NftFactory", "NftCreated", Box::new(NftCreatedHandler));
    handlers.register("Nft", "Minted", Box::new(MintedHandler));
}
