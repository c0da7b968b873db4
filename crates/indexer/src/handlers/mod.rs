//! Generated handler set for the sample schema: a Gravatar registry, an
//! ERC-20 token and an NFT factory whose collections register themselves
//! dynamically.

mod erc20;
mod gravatar;
mod nft;

use loom_engine::runtime::HandlerRegistry;

/// Register every generated handler.
pub fn default_handlers() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    gravatar::register(&mut handlers);
    erc20::register(&mut handlers);
    nft::register(&mut handlers);
    handlers
}
