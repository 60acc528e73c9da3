use alloy::{
    providers::{ProviderBuilder, RootProvider},
    transports::http::reqwest::Url,
};
use serde::{Deserialize, Serialize};

use crate::error::SubmitterError;

pub trait Chain: Send + Sync {
    fn chain_id(&self) -> u64;
    fn rpc_url(&self) -> Url;

    fn provider(&self) -> &RootProvider;
}

/// Ordered endpoint lists for block monitoring. Websocket endpoints are
/// always preferred over HTTP ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcEndpoints {
    pub ws: Vec<Url>,
    pub http: Vec<Url>,
}

impl RpcEndpoints {
    /// Sorts a flat list of endpoints into websocket and HTTP buckets by scheme,
    /// keeping the configured order inside each bucket.
    pub fn from_urls<I, S>(urls: I) -> Result<Self, SubmitterError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut endpoints = Self::default();
        for raw in urls {
            let url = Url::parse(raw.as_ref()).map_err(|e| SubmitterError::RpcConfigError {
                message: format!("Failed to parse RPC URL {}: {e}", raw.as_ref()),
            })?;

            match url.scheme() {
                "ws" | "wss" => endpoints.ws.push(url),
                "http" | "https" => endpoints.http.push(url),
                other => {
                    return Err(SubmitterError::RpcConfigError {
                        message: format!("Unsupported RPC URL scheme {other} in {url}"),
                    });
                }
            }
        }
        Ok(endpoints)
    }

    pub fn is_empty(&self) -> bool {
        self.ws.is_empty() && self.http.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ws.len() + self.http.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainConfig {
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct SubmitterChain {
    chain_id: u64,
    rpc_url: Url,
    endpoints: RpcEndpoints,

    pub provider: RootProvider,
}

impl Chain for SubmitterChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn rpc_url(&self) -> Url {
        self.rpc_url.clone()
    }

    fn provider(&self) -> &RootProvider {
        &self.provider
    }
}

impl SubmitterChain {
    pub fn endpoints(&self) -> &RpcEndpoints {
        &self.endpoints
    }
}

impl ChainConfig {
    /// Builds the request provider from the first HTTP endpoint. Block
    /// monitoring uses the full endpoint list separately.
    pub fn to_chain(&self) -> Result<SubmitterChain, SubmitterError> {
        let endpoints = RpcEndpoints::from_urls(&self.rpc_urls)?;

        let rpc_url = endpoints
            .http
            .first()
            .cloned()
            .ok_or_else(|| SubmitterError::RpcConfigError {
                message: format!("No HTTP RPC URL configured for chain {}", self.chain_id),
            })?;

        Ok(SubmitterChain {
            chain_id: self.chain_id,
            rpc_url: rpc_url.clone(),
            endpoints,
            provider: ProviderBuilder::new()
                .disable_recommended_fillers()
                .connect_http(rpc_url),
        })
    }
}
