use alloy::primitives::{B256, Log};
use alloy::sol;
use alloy::sol_types::SolEvent;
use serde_json::json;

use crate::{DecodedLog, EventDecoder};

sol! {
    event NewGravatar(uint256 id, address owner, string displayName, string imageUrl);
    event UpdatedGravatar(uint256 id, address owner, string displayName, string imageUrl);
}

/// Gravatar registry decoder.
///
/// Handles:
/// - `NewGravatar(uint256 id, address owner, string displayName, string imageUrl)`
/// - `UpdatedGravatar(uint256 id, address owner, string displayName, string imageUrl)`
pub struct GravatarDecoder;

impl EventDecoder for GravatarDecoder {
    fn contract_type(&self) -> &'static str {
        "Gravatar"
    }

    fn topics(&self) -> Vec<B256> {
        vec![NewGravatar::SIGNATURE_HASH, UpdatedGravatar::SIGNATURE_HASH]
    }

    fn decode(&self, log: &Log) -> Option<Result<DecodedLog, String>> {
        let topic0 = log.topics().first()?;

        if *topic0 == NewGravatar::SIGNATURE_HASH {
            Some(
                NewGravatar::decode_log_data(&log.data)
                    .map(|event| DecodedLog {
                        event_name: "NewGravatar",
                        params: gravatar_params(&event.id.to_string(), event.owner, &event.displayName, &event.imageUrl),
                    })
                    .map_err(|e| e.to_string()),
            )
        } else if *topic0 == UpdatedGravatar::SIGNATURE_HASH {
            Some(
                UpdatedGravatar::decode_log_data(&log.data)
                    .map(|event| DecodedLog {
                        event_name: "UpdatedGravatar",
                        params: gravatar_params(&event.id.to_string(), event.owner, &event.displayName, &event.imageUrl),
                    })
                    .map_err(|e| e.to_string()),
            )
        } else {
            None
        }
    }
}

fn gravatar_params(
    id: &str,
    owner: alloy::primitives::Address,
    display_name: &str,
    image_url: &str,
) -> serde_json::Value {
    json!({
        "id": id,
        "owner": format!("{owner:#x}"),
        "displayName": display_name,
        "imageUrl": image_url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, U256};

    #[test]
    fn declares_two_topics() {
        assert_eq!(GravatarDecoder.topics().len(), 2);
        assert_eq!(GravatarDecoder.contract_type(), "Gravatar");
    }

    #[test]
    fn decodes_updated_gravatar() {
        let event = UpdatedGravatar {
            id: U256::from(1002u64),
            owner: Address::repeat_byte(0xaa),
            displayName: "second".to_string(),
            imageUrl: "https://example.com/2.png".to_string(),
        };
        let log = Log { address: Address::repeat_byte(0x2e), data: event.encode_log_data() };

        let decoded = GravatarDecoder.decode(&log).unwrap().unwrap();
        assert_eq!(decoded.event_name, "UpdatedGravatar");
        assert_eq!(decoded.params["id"], "1002");
        assert_eq!(decoded.params["displayName"], "second");
        assert_eq!(
            decoded.params["owner"],
            format!("{:#x}", Address::repeat_byte(0xaa))
        );
    }

    #[test]
    fn foreign_topic_is_not_handled() {
        let log = Log {
            address: Address::repeat_byte(0x2e),
            data: alloy::primitives::LogData::new_unchecked(
                vec![B256::repeat_byte(0x01)],
                Default::default(),
            ),
        };
        assert!(GravatarDecoder.decode(&log).is_none());
    }
}
