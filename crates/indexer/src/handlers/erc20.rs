use serde_json::json;

use loom_common::error::IndexerError;
use loom_common::types::DecodedEvent;
use loom_engine::runtime::{EventHandler, HandlerContext, HandlerRegistry, LoaderContext};

/// Balance arithmetic happens in i128; stored balances stay decimal
/// strings so token amounts survive JSON round trips.
fn balance_of(ctx: &HandlerContext<'_>, id: &str) -> i128 {
    ctx.get("Account", id)
        .and_then(|account| {
            account["balance"]
                .as_str()
                .and_then(|raw| raw.parse::<i128>().ok())
        })
        .unwrap_or(0)
}

struct TransferHandler;

impl EventHandler for TransferHandler {
    fn register_loads(&self, event: &DecodedEvent, loader: &mut LoaderContext) {
        for side in ["from", "to"] {
            if let Some(id) = event.params[side].as_str() {
                loader.load("Account", id);
            }
        }
    }

    fn handle(
        &self,
        event: &DecodedEvent,
        ctx: &mut HandlerContext<'_>,
    ) -> Result<(), IndexerError> {
        let from = event.params["from"].as_str().unwrap_or_default();
        let to = event.params["to"].as_str().unwrap_or_default();
        let value: i128 = event.params["value"]
            .as_str()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);

        let sender_known = ctx.get("Account", from).is_some();
        let sender_balance = balance_of(ctx, from) - value;
        let sender = json!({"id": from, "balance": sender_balance.to_string()});
        if sender_known {
            ctx.update("Account", from, sender);
        } else {
            ctx.insert("Account", from, sender);
        }

        let recipient_known = ctx.get("Account", to).is_some();
        let recipient_balance = balance_of(ctx, to) + value;
        let recipient = json!({"id": to, "balance": recipient_balance.to_string()});
        if recipient_known {
            ctx.update("Account", to, recipient);
        } else {
            ctx.insert("Account", to, recipient);
        }
        Ok(())
    }
}

pub fn register(handlers: &mut HandlerRegistry) {
    handlers.register("Token", "Transfer", Box::new(TransferHandler));
}
