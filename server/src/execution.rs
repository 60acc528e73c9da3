use std::collections::HashMap;

use alloy::{
    network::EthereumWallet,
    primitives::{Address, B256, Bytes},
    providers::{DynProvider, Provider, ProviderBuilder},
    signers::local::PrivateKeySigner,
    sol,
};
use serde::{Deserialize, Serialize};
use submitter_core::{
    TrackKey,
    chain::{Chain, SubmitterChain},
    error::{ContractErrorToSubmitterError, SubmitterError},
};
use submitter_executors::{
    nonce_queue::{NonceSource, SubmitRequest},
    submit::{ExecutionPath, RequestHash},
};

sol! {
    #[sol(rpc)]
    interface IEntryPoint {
        function nonceValues(address account, uint192 nonceTrack) external view returns (uint64);
        function submit(bytes encodedBoop) external;
    }
}

/// A boop ready to be handed to the entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedBoop {
    pub boop_hash: B256,
    pub encoded: Bytes,
    /// Gas limit for the submit transaction. Estimated when absent.
    pub gas_limit: Option<u64>,
}

impl RequestHash for EncodedBoop {
    fn request_hash(&self) -> B256 {
        self.boop_hash
    }
}

/// Reads track nonces from the entry point contract.
#[derive(Clone)]
pub struct EntryPointNonceSource {
    pub chain: SubmitterChain,
    pub entry_point: Address,
}

impl NonceSource for EntryPointNonceSource {
    async fn fetch_nonce(&self, track: TrackKey) -> Result<u64, SubmitterError> {
        let entry_point = IEntryPoint::new(self.entry_point, self.chain.provider().clone());

        entry_point
            .nonceValues(track.account, track.nonce_track)
            .call()
            .await
            .map_err(|e| e.to_submitter_error(&self.chain))
    }
}

/// Sends boops to the entry point, signing with the executor's local key.
pub struct EntryPointExecutor {
    chain: SubmitterChain,
    entry_point: Address,
    providers: HashMap<Address, DynProvider>,
}

impl EntryPointExecutor {
    pub fn new(
        chain: SubmitterChain,
        entry_point: Address,
        private_keys: &[String],
    ) -> Result<Self, SubmitterError> {
        let mut providers = HashMap::with_capacity(private_keys.len());

        for key in private_keys {
            let signer: PrivateKeySigner = key.parse().map_err(|e| SubmitterError::SignerError {
                message: format!("Invalid executor private key: {e}"),
            })?;
            let address = signer.address();

            let provider = ProviderBuilder::new()
                .with_chain_id(chain.chain_id())
                .wallet(EthereumWallet::from(signer))
                .connect_http(chain.rpc_url())
                .erased();

            tracing::info!(executor = %address, chain_id = chain.chain_id(), "Loaded executor account");
            providers.insert(address, provider);
        }

        Ok(Self {
            chain,
            entry_point,
            providers,
        })
    }

    pub fn executors(&self) -> Vec<Address> {
        self.providers.keys().copied().collect()
    }
}

impl ExecutionPath for EntryPointExecutor {
    type Payload = EncodedBoop;

    #[tracing::instrument(name = "entrypoint_submit", skip_all, fields(executor = %executor, boop_hash = %request.payload.boop_hash, nonce = request.nonce_value))]
    async fn execute(
        &self,
        executor: Address,
        request: &SubmitRequest<EncodedBoop>,
    ) -> Result<B256, SubmitterError> {
        let provider = self
            .providers
            .get(&executor)
            .ok_or_else(|| SubmitterError::SignerError {
                message: format!("No signer loaded for executor {executor}"),
            })?;

        let entry_point = IEntryPoint::new(self.entry_point, provider.clone());
        let mut call = entry_point
            .submit(request.payload.encoded.clone())
            .from(executor);
        if let Some(gas_limit) = request.payload.gas_limit {
            call = call.gas(gas_limit);
        }

        let pending = call
            .send()
            .await
            .map_err(|e| e.to_submitter_error(&self.chain))?;

        let transaction_hash = *pending.tx_hash();
        tracing::debug!(transaction_hash = %transaction_hash, "Submitted boop to entry point");
        Ok(transaction_hash)
    }
}
