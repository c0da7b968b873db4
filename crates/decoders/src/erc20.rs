use alloy::primitives::{B256, Log};
use alloy::sol;
use alloy::sol_types::SolEvent;
use serde_json::json;

use crate::{DecodedLog, EventDecoder};

sol! {
    event Transfer(address indexed from, address indexed to, uint256 value);
}

/// ERC-20 token decoder. Handles the standard `Transfer` event.
pub struct TokenDecoder;

impl EventDecoder for TokenDecoder {
    fn contract_type(&self) -> &'static str {
        "Token"
    }

    fn topics(&self) -> Vec<B256> {
        vec![Transfer::SIGNATURE_HASH]
    }

    fn decode(&self, log: &Log) -> Option<Result<DecodedLog, String>> {
        let topic0 = log.topics().first()?;
        if *topic0 != Transfer::SIGNATURE_HASH {
            return None;
        }

        Some(
            Transfer::decode_log_data(&log.data)
                .map(|event| DecodedLog {
                    event_name: "Transfer",
                    params: json!({
                        "from": format!("{:#x}", event.from),
                        "to": format!("{:#x}", event.to),
                        "value": event.value.to_string(),
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
    fn decodes_transfer_with_decimal_value() {
        let event = Transfer {
            from: Address::repeat_byte(0xaa),
            to: Address::repeat_byte(0xbb),
            value: U256::from(3u64),
        };
        let log = Log { address: Address::repeat_byte(0x10), data: event.encode_log_data() };

        let decoded = TokenDecoder.decode(&log).unwrap().unwrap();
        assert_eq!(decoded.event_name, "Transfer");
        assert_eq!(decoded.params["value"], "3");
        assert_eq!(decoded.params["from"], format!("{:#x}", Address::repeat_byte(0xaa)));
        assert_eq!(decoded.params["to"], format!("{:#x}", Address::repeat_byte(0xbb)));
    }
}
