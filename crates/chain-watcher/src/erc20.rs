use battle_domain::TokenAmount;
use ethabi::ParamType;
use ethabi::ethereum_types::U256;
use sha3::{Digest, Keccak256};
use thiserror::Error;

use crate::rpc::EthLog;

pub const TRANSFER_EVENT_SIGNATURE: &str = "Transfer(address,address,uint256)";

/// keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_EVENT_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Erc20DecodeError {
    #[error("invalid hex in {field}: {value}")]
    Hex { field: &'static str, value: String },
    #[error("topic is not a 32-byte word: {0}")]
    TopicLength(String),
    #[error("transfer amount is not a uint256: {0}")]
    Amount(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTransfer {
    pub from: String,
    pub to: String,
    pub amount: U256,
}

#[must_use]
pub fn event_topic(signature: &str) -> String {
    format!("0x{}", hex::encode(Keccak256::digest(signature.as_bytes())))
}

/// A standard ERC-20 `Transfer`: signature topic plus exactly two indexed addresses.
#[must_use]
pub fn is_transfer_log(log: &EthLog) -> bool {
    log.topics.len() == 3
        && log
            .topics
            .first()
            .is_some_and(|t| t.eq_ignore_ascii_case(TRANSFER_EVENT_TOPIC))
}

pub fn decode_transfer_log(log: &EthLog) -> Result<DecodedTransfer, Erc20DecodeError> {
    let from = topic_to_address(&log.topics[1])?;
    let to = topic_to_address(&log.topics[2])?;
    let amount = decode_uint256(&log.data)?;
    Ok(DecodedTransfer { from, to, amount })
}

/// Right-most 20 bytes of an indexed address topic, as lowercase `0x` hex.
pub fn topic_to_address(topic: &str) -> Result<String, Erc20DecodeError> {
    let bytes = decode_hex("topic", topic)?;
    if bytes.len() != 32 {
        return Err(Erc20DecodeError::TopicLength(topic.to_string()));
    }
    Ok(format!("0x{}", hex::encode(&bytes[12..])))
}

pub fn decode_uint256(data: &str) -> Result<U256, Erc20DecodeError> {
    let bytes = decode_hex("data", data)?;
    let tokens = ethabi::decode(&[ParamType::Uint(256)], &bytes)
        .map_err(|e| Erc20DecodeError::Amount(e.to_string()))?;
    match tokens.into_iter().next() {
        Some(ethabi::Token::Uint(value)) => Ok(value),
        other => Err(Erc20DecodeError::Amount(format!("{other:?}"))),
    }
}

/// Base units above `u128::MAX` have no `TokenAmount` representation.
#[must_use]
pub fn u256_to_token_amount(value: U256) -> Option<TokenAmount> {
    (value <= U256::from(u128::MAX)).then(|| TokenAmount(value.low_u128()))
}

/// `|actual - expected| * denominator <= expected`
#[must_use]
pub fn within_relative_tolerance(actual: U256, expected: U256, denominator: u64) -> bool {
    let diff = if actual >= expected {
        actual - expected
    } else {
        expected - actual
    };
    diff.checked_mul(U256::from(denominator))
        .is_some_and(|scaled| scaled <= expected)
}

fn decode_hex(field: &'static str, value: &str) -> Result<Vec<u8>, Erc20DecodeError> {
    let s = value.trim();
    let raw = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(raw).map_err(|_| Erc20DecodeError::Hex {
        field,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_topic_matches_keccak_of_signature() {
        assert_eq!(event_topic(TRANSFER_EVENT_SIGNATURE), TRANSFER_EVENT_TOPIC);
    }

    #[test]
    fn topic_to_address_takes_low_twenty_bytes() {
        let topic = format!("0x{}{}", "0".repeat(24), "ABCDEF0123456789abcdef0123456789ABCDEF01");
        assert_eq!(
            topic_to_address(&topic).expect("address"),
            "0xabcdef0123456789abcdef0123456789abcdef01"
        );
        assert!(topic_to_address("0x1234").is_err());
    }

    #[test]
    fn decode_uint256_reads_abi_word() {
        let data = format!("0x{:064x}", 1_000_000_000_000_000_000_u128);
        assert_eq!(
            decode_uint256(&data).expect("amount"),
            U256::from(1_000_000_000_000_000_000_u128)
        );
        assert!(decode_uint256("0x").is_err());
        assert!(decode_uint256("0xzz").is_err());
    }

    #[test]
    fn transfer_log_shape_requires_three_topics() {
        let mut log = EthLog {
            address: "0xtoken".to_string(),
            topics: vec![
                TRANSFER_EVENT_TOPIC.to_uppercase().replace("0X", "0x"),
                format!("0x{}", "0".repeat(64)),
                format!("0x{}", "0".repeat(64)),
            ],
            data: format!("0x{:064x}", 1_u8),
        };
        assert!(is_transfer_log(&log));
        log.topics.push(format!("0x{}", "0".repeat(64)));
        assert!(!is_transfer_log(&log));
    }

    #[test]
    fn tolerance_is_one_basis_point_of_a_percent() {
        let expected = U256::from(100_000_u64);
        assert!(within_relative_tolerance(U256::from(100_005_u64), expected, 10_000));
        assert!(within_relative_tolerance(U256::from(99_990_u64), expected, 10_000));
        assert!(!within_relative_tolerance(U256::from(100_020_u64), expected, 10_000));
        assert!(!within_relative_tolerance(U256::from(99_989_u64), expected, 10_000));
    }

    #[test]
    fn oversized_amounts_have_no_token_amount() {
        assert_eq!(u256_to_token_amount(U256::from(5_u8)), Some(TokenAmount(5)));
        assert_eq!(u256_to_token_amount(U256::MAX), None);
    }
}
