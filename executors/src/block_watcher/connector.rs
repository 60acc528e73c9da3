use std::future::Future;

use alloy::{
    providers::{Provider, ProviderBuilder, RootProvider, WsConnect},
    rpc::types::BlockNumberOrTag,
    transports::http::reqwest::Url,
};
use futures::{StreamExt, stream::BoxStream};
use submitter_core::BlockHeader;

use super::transport::TransportError;

/// Live `newHeads` notifications, normalised to [`BlockHeader`]s.
pub type BlockStream = BoxStream<'static, Result<BlockHeader, TransportError>>;

/// Opens block streams against RPC endpoints.
pub trait EndpointConnector: Send + Sync + 'static {
    type Poller: BlockPoller;

    /// Subscribes to `newHeads` over a websocket endpoint.
    fn subscribe_blocks(
        &self,
        url: &Url,
    ) -> impl Future<Output = Result<BlockStream, TransportError>> + Send;

    /// Creates a client for an HTTP endpoint. Does not perform any request.
    fn connect_http(&self, url: &Url) -> Result<Self::Poller, TransportError>;
}

/// Request/response access used for HTTP polling.
pub trait BlockPoller: Send + Sync + 'static {
    fn block_number(&self) -> impl Future<Output = Result<u64, TransportError>> + Send;

    fn latest_block(&self) -> impl Future<Output = Result<Option<BlockHeader>, TransportError>> + Send;
}

/// [`EndpointConnector`] backed by alloy providers.
#[derive(Debug, Clone, Default)]
pub struct AlloyConnector;

#[derive(Debug, Clone)]
pub struct AlloyPoller {
    url: Url,
    provider: RootProvider,
}

impl EndpointConnector for AlloyConnector {
    type Poller = AlloyPoller;

    async fn subscribe_blocks(&self, url: &Url) -> Result<BlockStream, TransportError> {
        let provider: RootProvider = ProviderBuilder::new()
            .disable_recommended_fillers()
            .connect_ws(WsConnect::new(url.as_str()))
            .await
            .map_err(|e| TransportError::Connection {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let subscription =
            provider
                .subscribe_blocks()
                .await
                .map_err(|e| TransportError::Subscription {
                    url: url.to_string(),
                    message: e.to_string(),
                })?;

        let url = url.clone();
        // Header notifications do not carry the transaction list, so each one
        // is followed by a block fetch. The provider is moved into the stream to
        // keep the websocket alive.
        let stream = subscription.into_stream().then(move |header| {
            let provider = provider.clone();
            let url = url.clone();
            async move {
                match provider.get_block_by_hash(header.hash).await {
                    Ok(Some(block)) => Ok(BlockHeader::from(block)),
                    Ok(None) => {
                        tracing::warn!(
                            url = %url,
                            block_number = header.inner.number,
                            "Block from newHeads not found, continuing without its transactions"
                        );
                        Ok(BlockHeader::from_rpc_header(&header))
                    }
                    Err(e) => Err(TransportError::Subscription {
                        url: url.to_string(),
                        message: format!(
                            "failed to fetch block {} from notification: {e}",
                            header.inner.number
                        ),
                    }),
                }
            }
        });

        Ok(stream.boxed())
    }

    fn connect_http(&self, url: &Url) -> Result<AlloyPoller, TransportError> {
        let provider: RootProvider = ProviderBuilder::new()
            .disable_recommended_fillers()
            .connect_http(url.clone());

        Ok(AlloyPoller {
            url: url.clone(),
            provider,
        })
    }
}

impl BlockPoller for AlloyPoller {
    async fn block_number(&self) -> Result<u64, TransportError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| TransportError::Connection {
                url: self.url.to_string(),
                message: e.to_string(),
            })
    }

    async fn latest_block(&self) -> Result<Option<BlockHeader>, TransportError> {
        self.provider
            .get_block_by_number(BlockNumberOrTag::Latest)
            .await
            .map(|block| block.map(BlockHeader::from))
            .map_err(|e| TransportError::Polling {
                url: self.url.to_string(),
                message: e.to_string(),
            })
    }
}
