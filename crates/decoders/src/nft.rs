use alloy::primitives::{B256, Log};
use alloy::sol;
use alloy::sol_types::SolEvent;
use serde_json::json;

use crate::{DecodedLog, EventDecoder};

sol! {
    event NftCreated(address nft, address creator);
    event Minted(address indexed to, uint256 tokenId);
}

/// Factory decoder: `NftCreated` announces a freshly deployed collection
/// whose address handlers then register dynamically.
pub struct NftFactoryDecoder;

impl EventDecoder for NftFactoryDecoder {
    fn contract_type(&self) -> &'static str {
        "NftFactory"
    }

    fn topics(&self) -> Vec<B256> {
        vec![NftCreated::SIGNATURE_HASH]
    }

    fn decode(&self, log: &Log) -> Option<Result<DecodedLog, String>> {
        let topic0 = log.topics().first()?;
        if *topic0 != NftCreated::SIGNATURE_HASH {
            return None;
        }

        Some(
            NftCreated::decode_log_data(&log.data)
                .map(|event| DecodedLog {
                    event_name: "NftCreated",
                    params: json!({
                        "nft": format!("{:#x}", event.nft),
                        "creator": format!("{:#x}", event.creator),
                    }),
                })
                .map_err(|e| e.to_string()),
        )
    }
}

/// Decoder for dynamically registered collections.
pub struct NftDecoder;

impl EventDecoder for NftDecoder {
    fn contract_type(&self) -> &'static str {
        "Nft"
    }

    fn topics(&self) -> Vec<B256> {
        vec![Minted::SIGNATURE_HASH]
    }

    fn decode(&self, log: &Log) -> Option<Result<DecodedLog, String>> {
        let topic0 = log.topics().first()?;
        if *topic0 != Minted::SIGNATURE_HASH {
            return None;
        }

        Some(
            Minted::decode_log_data(&log.data)
                .map(|event| DecodedLog {
                    event_name: "Minted",
                    params: json!({
                        "to": format!("{:#x}", event.to),
                        "tokenId": event.tokenId.to_string(),
                    }),
                })
                .map_err(|e| e.to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, U256};

    #[test]
    fn factory_decodes_nft_created() {
        let event = NftCreated {
            nft: Address::repeat_byte(0x4e),
            creator: Address::repeat_byte(0xcc),
        };
        let log = Log { address: Address::repeat_byte(0xfa), data: event.encode_log_data() };

        let decoded = NftFactoryDecoder.decode(&log).unwrap().unwrap();
        assert_eq!(decoded.event_name, "NftCreated");
        assert_eq!(decoded.params["nft"], format!("{:#x}", Address::repeat_byte(0x4e)));
    }

    #[test]
    fn collection_decodes_minted() {
        let event = Minted { to: Address::repeat_byte(0x77), tokenId: U256::from(9u64) };
        let log = Log { address: Address::repeat_byte(0x4e), data: event.encode_log_data() };

        let decoded = NftDecoder.decode(&log).unwrap().unwrap();
        assert_eq!(decoded.event_name, "Minted");
        assert_eq!(decoded.params["tokenId"], "9");
    }
}
