//! Protobuf shapes for the oracle vote messages and the enclosing
//! Cosmos transaction envelope, defined manually with prost.

use prost::Message;
use sha2::{Digest, Sha256};

pub const PREVOTE_TYPE_URL: &str = "/persistence.oracle.v1beta1.MsgAggregateExchangeRatePrevote";
pub const VOTE_TYPE_URL: &str = "/persistence.oracle.v1beta1.MsgAggregateExchangeRateVote";
pub const SECP256K1_PUBKEY_TYPE_URL: &str = "/cosmos.crypto.secp256k1.PubKey";

pub const SIGN_MODE_DIRECT: i32 = 1;

/// Commitment half of the commit-reveal vote.
#[derive(Clone, PartialEq, Message)]
pub struct MsgAggregateExchangeRatePrevote {
    #[prost(string, tag = "1")]
    pub hash: String,
    #[prost(string, tag = "2")]
    pub feeder: String,
    #[prost(string, tag = "3")]
    pub validator: String,
}

/// Reveal half of the commit-reveal vote.
#[derive(Clone, PartialEq, Message)]
pub struct MsgAggregateExchangeRateVote {
    #[prost(string, tag = "1")]
    pub salt: String,
    #[prost(string, tag = "2")]
    pub exchange_rates: String,
    #[prost(string, tag = "3")]
    pub feeder: String,
    #[prost(string, tag = "4")]
    pub validator: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Any {
    #[prost(string, tag = "1")]
    pub type_url: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Coin {
    #[prost(string, tag = "1")]
    pub denom: String,
    #[prost(string, tag = "2")]
    pub amount: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct TxBody {
    #[prost(message, repeated, tag = "1")]
    pub messages: Vec<Any>,
    #[prost(string, tag = "2")]
    pub memo: String,
    #[prost(uint64, tag = "3")]
    pub timeout_height: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct Fee {
    #[prost(message, repeated, tag = "1")]
    pub amount: Vec<Coin>,
    #[prost(uint64, tag = "2")]
    pub gas_limit: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct ModeInfoSingle {
    #[prost(int32, tag = "1")]
    pub mode: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct ModeInfo {
    #[prost(message, optional, tag = "1")]
    pub single: Option<ModeInfoSingle>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SignerInfo {
    #[prost(message, optional, tag = "1")]
    pub public_key: Option<Any>,
    #[prost(message, optional, tag = "2")]
    pub mode_info: Option<ModeInfo>,
    #[prost(uint64, tag = "3")]
    pub sequence: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct AuthInfo {
    #[prost(message, repeated, tag = "1")]
    pub signer_infos: Vec<SignerInfo>,
    #[prost(message, optional, tag = "2")]
    pub fee: Option<Fee>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SignDoc {
    #[prost(bytes = "vec", tag = "1")]
    pub body_bytes: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub auth_info_bytes: Vec<u8>,
    #[prost(string, tag = "3")]
    pub chain_id: String,
    #[prost(uint64, tag = "4")]
    pub account_number: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct TxRaw {
    #[prost(bytes = "vec", tag = "1")]
    pub body_bytes: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub auth_info_bytes: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub signatures: Vec<Vec<u8>>,
}

/// Secp256k1 public key wrapper.
#[derive(Clone, PartialEq, Message)]
pub struct PubKey {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
}

pub fn to_any<M: Message>(type_url: &str, msg: &M) -> Any {
    Any {
        type_url: type_url.to_string(),
        value: msg.encode_to_vec(),
    }
}

/// The `x/oracle` aggregate vote hash: SHA-256 over
/// `salt:exchangeRates:validator`, truncated to 20 bytes, hex-encoded.
/// The prevote commits to this; the reveal must reproduce it.
pub fn aggregate_vote_hash(salt: &str, exchange_rates: &str, validator: &str) -> String {
    let digest = Sha256::digest(format!("{salt}:{exchange_rates}:{validator}").as_bytes());
    hex::encode(&digest[..20])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_hash_is_twenty_bytes_hex() {
        let hash = aggregate_vote_hash(
            "abcd",
            "ATOM:28.210000000000000000",
            "persistencevaloper1xyz",
        );
        assert_eq!(hash.len(), 40);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn vote_hash_commits_to_every_input() {
        let base = aggregate_vote_hash("salt", "rates", "val");
        assert_ne!(base, aggregate_vote_hash("salt2", "rates", "val"));
        assert_ne!(base, aggregate_vote_hash("salt", "rates2", "val"));
        assert_ne!(base, aggregate_vote_hash("salt", "rates", "val2"));
        // Deterministic.
        assert_eq!(base, aggregate_vote_hash("salt", "rates", "val"));
    }

    #[test]
    fn any_wraps_prevote() {
        let msg = MsgAggregateExchangeRatePrevote {
            hash: "ab".to_string(),
            feeder: "feeder".to_string(),
            validator: "validator".to_string(),
        };
        let any = to_any(PREVOTE_TYPE_URL, &msg);
        assert_eq!(any.type_url, PREVOTE_TYPE_URL);
        let decoded = MsgAggregateExchangeRatePrevote::decode(any.value.as_slice()).unwrap();
        assert_eq!(decoded, msg);
    }
}
