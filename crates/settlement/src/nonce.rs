use std::sync::Arc;

use chain_watcher::{EvmJsonRpcClient, RetryPolicy, RpcError};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::SettlementError;

pub enum NonceCommand {
    Reserve {
        reply: oneshot::Sender<Result<u64, RpcError>>,
    },
    /// Forget the local counter; the next reservation follows the chain's pending count.
    Resync { reply: oneshot::Sender<()> },
}

/// Handle to the single task that owns nonce allocation for one signing account.
#[derive(Debug, Clone)]
pub struct NonceAllocator {
    sender: mpsc::Sender<NonceCommand>,
}

impl NonceAllocator {
    pub fn spawn(
        client: Arc<dyn EvmJsonRpcClient>,
        signer_address: impl Into<String>,
        retry: RetryPolicy,
        queue_capacity: usize,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel(queue_capacity.max(1));
        let signer_address = signer_address.into();

        tokio::spawn(async move {
            let mut next_nonce: Option<u64> = None;
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    NonceCommand::Reserve { reply } => {
                        let result = retry
                            .run("eth_getTransactionCount", || {
                                client.pending_transaction_count(&signer_address)
                            })
                            .await
                            .map(|chain_pending| {
                                let nonce = next_nonce
                                    .map_or(chain_pending, |local| local.max(chain_pending));
                                next_nonce = Some(nonce.saturating_add(1));
                                nonce
                            });
                        if let Ok(nonce) = &result {
                            debug!(signer = %signer_address, nonce, "nonce reserved");
                        }
                        let _ = reply.send(result);
                    }
                    NonceCommand::Resync { reply } => {
                        next_nonce = None;
                        debug!(signer = %signer_address, "nonce counter reset");
                        let _ = reply.send(());
                    }
                }
            }
        });

        Self { sender: tx }
    }

    pub async fn reserve(&self) -> Result<u64, SettlementError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(NonceCommand::Reserve { reply: tx })
            .await
            .map_err(|_| SettlementError::NonceAllocator("allocator unavailable".to_string()))?;
        rx.await
            .map_err(|_| SettlementError::NonceAllocator("allocator dropped reply".to_string()))?
            .map_err(SettlementError::Rpc)
    }

    pub async fn resync(&self) -> Result<(), SettlementError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(NonceCommand::Resync { reply: tx })
            .await
            .map_err(|_| SettlementError::NonceAllocator("allocator unavailable".to_string()))?;
        rx.await
            .map_err(|_| SettlementError::NonceAllocator("allocator dropped reply".to_string()))
    }
}
