//! Minimal gRPC client for the chain queries the feeder needs: oracle
//! params, account number/sequence and gas simulation.
//!
//! The services involved are small enough that the request/response
//! messages are declared by hand and sent through tonic's unary codec
//! rather than generating a full client.

use std::time::Duration;

use prost::Message;
use tonic::codec::ProstCodec;
use tonic::transport::Channel;
use tonic::Request;

use crate::chain::{ChainError, OracleParams};

const PARAMS_QUERY_TIMEOUT: Duration = Duration::from_secs(15);

const ORACLE_PARAMS_PATH: &str = "/persistence.oracle.v1beta1.Query/Params";
const AUTH_ACCOUNT_PATH: &str = "/cosmos.auth.v1beta1.Query/Account";
const TX_SIMULATE_PATH: &str = "/cosmos.tx.v1beta1.Service/Simulate";

#[derive(Clone, PartialEq, Message)]
struct QueryParamsRequest {}

#[derive(Clone, PartialEq, Message)]
struct QueryParamsResponse {
    #[prost(message, optional, tag = "1")]
    params: Option<ParamsPb>,
}

#[derive(Clone, PartialEq, Message)]
struct ParamsPb {
    #[prost(uint64, tag = "1")]
    vote_period: u64,
    #[prost(message, repeated, tag = "5")]
    accept_list: Vec<DenomPb>,
}

#[derive(Clone, PartialEq, Message)]
struct DenomPb {
    #[prost(string, tag = "1")]
    base_denom: String,
    #[prost(string, tag = "2")]
    symbol_denom: String,
    #[prost(uint32, tag = "3")]
    exponent: u32,
}

#[derive(Clone, PartialEq, Message)]
struct QueryAccountRequest {
    #[prost(string, tag = "1")]
    address: String,
}

#[derive(Clone, PartialEq, Message)]
struct QueryAccountResponse {
    #[prost(message, optional, tag = "1")]
    account: Option<crate::chain::msgs::Any>,
}

#[derive(Clone, PartialEq, Message)]
struct BaseAccount {
    #[prost(string, tag = "1")]
    address: String,
    #[prost(message, optional, tag = "2")]
    pub_key: Option<crate::chain::msgs::Any>,
    #[prost(uint64, tag = "3")]
    account_number: u64,
    #[prost(uint64, tag = "4")]
    sequence: u64,
}

#[derive(Clone, PartialEq, Message)]
struct SimulateRequest {
    #[prost(bytes = "vec", tag = "2")]
    tx_bytes: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
struct SimulateResponse {
    #[prost(message, optional, tag = "1")]
    gas_info: Option<GasInfo>,
}

#[derive(Clone, PartialEq, Message)]
struct GasInfo {
    #[prost(uint64, tag = "1")]
    gas_wanted: u64,
    #[prost(uint64, tag = "2")]
    gas_used: u64,
}

#[derive(Clone)]
pub struct GrpcClient {
    endpoint: String,
}

impl GrpcClient {
    pub fn new(endpoint: &str) -> Self {
        let endpoint = if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("http://{endpoint}")
        };
        Self { endpoint }
    }

    /// Current `x/oracle` module parameters.
    pub async fn oracle_params(&self) -> Result<OracleParams, ChainError> {
        let resp: QueryParamsResponse = self
            .unary(ORACLE_PARAMS_PATH, QueryParamsRequest {})
            .await?;
        let params = resp
            .params
            .ok_or_else(|| ChainError::Grpc("empty params response".to_string()))?;

        Ok(OracleParams {
            vote_period: params.vote_period,
            accept_list: params
                .accept_list
                .into_iter()
                .map(|d| d.symbol_denom.to_uppercase())
                .collect(),
        })
    }

    /// Account number and sequence for the feeder account.
    pub async fn account(&self, address: &str) -> Result<(u64, u64), ChainError> {
        let resp: QueryAccountResponse = self
            .unary(
                AUTH_ACCOUNT_PATH,
                QueryAccountRequest {
                    address: address.to_string(),
                },
            )
            .await?;
        let any = resp
            .account
            .ok_or_else(|| ChainError::Grpc(format!("account {address} not found")))?;
        let account = BaseAccount::decode(any.value.as_slice())
            .map_err(|e| ChainError::Grpc(format!("malformed account: {e}")))?;

        Ok((account.account_number, account.sequence))
    }

    /// Gas consumed by executing `tx_bytes` against the current state.
    pub async fn simulate_gas(&self, tx_bytes: Vec<u8>) -> Result<u64, ChainError> {
        let resp: SimulateResponse = self
            .unary(TX_SIMULATE_PATH, SimulateRequest { tx_bytes })
            .await?;
        resp.gas_info
            .map(|g| g.gas_used)
            .ok_or_else(|| ChainError::Grpc("simulate returned no gas info".to_string()))
    }

    /// One unary call, dialing per request the way the feeder's queries
    /// are spaced apart.
    async fn unary<T, R>(&self, path: &'static str, request: T) -> Result<R, ChainError>
    where
        T: Message + Send + Sync + 'static,
        R: Message + Default + Send + Sync + 'static,
    {
        let call = async {
            let channel = Channel::from_shared(self.endpoint.clone())
                .map_err(|e| ChainError::Grpc(e.to_string()))?
                .connect()
                .await
                .map_err(|e| ChainError::Grpc(e.to_string()))?;

            let mut client = tonic::client::Grpc::new(channel);
            client
                .ready()
                .await
                .map_err(|e| ChainError::Grpc(e.to_string()))?;

            let codec: ProstCodec<T, R> = ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(path);
            let response = client
                .unary(Request::new(request), path, codec)
                .await
                .map_err(|status| ChainError::Grpc(status.to_string()))?;

            Ok(response.into_inner())
        };

        tokio::time::timeout(PARAMS_QUERY_TIMEOUT, call)
            .await
            .map_err(|_| ChainError::Grpc("query timed out".to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_scheme_is_defaulted() {
        assert_eq!(
            GrpcClient::new("localhost:9090").endpoint,
            "http://localhost:9090"
        );
        assert_eq!(
            GrpcClient::new("https://grpc.example.com").endpoint,
            "https://grpc.example.com"
        );
    }

    #[test]
    fn accept_list_symbols_are_uppercased() {
        // Exercise the response mapping without a live endpoint.
        let resp = QueryParamsResponse {
            params: Some(ParamsPb {
                vote_period: 10,
                accept_list: vec![
                    DenomPb {
                        base_denom: "uatom".to_string(),
                        symbol_denom: "atom".to_string(),
                        exponent: 6,
                    },
                    DenomPb {
                        base_denom: "uxprt".to_string(),
                        symbol_denom: "xprt".to_string(),
                        exponent: 6,
                    },
                ],
            }),
        };

        let params = resp.params.unwrap();
        let symbols: Vec<String> = params
            .accept_list
            .iter()
            .map(|d| d.symbol_denom.to_uppercase())
            .collect();
        assert_eq!(symbols, vec!["ATOM", "XPRT"]);
    }
}
