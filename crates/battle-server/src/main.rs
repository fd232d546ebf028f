use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use audit_store::{AuditRepository, InMemoryAuditRepository, PostgresAuditRepository};
use battle_domain::{addresses_equal, normalize_address};
use battle_service::BattleLifecycleManager;
use chain_watcher::{
    EvmJsonRpcClient, EvmTransferVerifier, ReqwestEvmJsonRpcClient, RetryPolicy, VerifierConfig,
};
use ledger_store::{
    InMemorySettlementStore, LedgerStore, ModeConfigRepository, PostgresSettlementStore,
};
use observability::init_tracing;
use platform_core::AppConfig;
use settlement::{EscrowGatewayConfig, EvmEscrowGateway};
use tracing::{info, warn};

const RECONCILE_INTERVAL: Duration = Duration::from_secs(15);
const MIN_RELEASE_CONFIRMATIONS: u64 = 3;
const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load().context("load configuration")?;
    init_tracing(&config.app.service_name, &config.observability.log_filter);
    warn_on_unset_addresses(&config);

    let (store, audit) = build_stores(&config).await?;
    let manager = build_manager(&config, store, audit);

    info!(
        env = config.app.env.as_str(),
        rpc_endpoint = %config.chain.rpc_endpoint,
        token_contract = %normalize_address(&config.chain.token_contract),
        treasury = %normalize_address(&config.chain.treasury_address),
        "battle server ready"
    );

    let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = manager.reconcile_escrow_releases(MIN_RELEASE_CONFIRMATIONS).await {
                    warn!(error = %err, "escrow release reconciliation failed");
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("listen for shutdown signal")?;
                info!("shutdown requested");
                break;
            }
        }
    }
    Ok(())
}

async fn build_stores(
    config: &AppConfig,
) -> Result<(Arc<dyn LedgerStore>, Arc<dyn AuditRepository>)> {
    if let Some(url) = config.database.url.as_deref() {
        let store = PostgresSettlementStore::connect(url, config.database.max_connections)
            .await
            .context("connect settlement database")?;
        let audit = PostgresAuditRepository::new(store.pool().clone());
        info!(max_connections = config.database.max_connections, "using postgres store");
        return Ok((Arc::new(store), Arc::new(audit)));
    }

    let store = InMemorySettlementStore::new();
    for mode_config in config.modes.mode_configs().context("parse mode configs")? {
        store
            .upsert_mode_config(&mode_config)
            .await
            .context("seed mode configs")?;
    }
    warn!("database.url not set; settlement state is kept in memory");
    Ok((Arc::new(store), Arc::new(InMemoryAuditRepository::default())))
}

fn build_manager(
    config: &AppConfig,
    store: Arc<dyn LedgerStore>,
    audit: Arc<dyn AuditRepository>,
) -> BattleLifecycleManager {
    let chain = &config.chain;
    let rpc = ReqwestEvmJsonRpcClient::with_timeout(
        chain.rpc_endpoint.clone(),
        Duration::from_millis(chain.rpc_timeout_ms),
    );
    let retry = RetryPolicy {
        max_attempts: chain.retry.max_attempts,
        base_backoff_ms: chain.retry.base_backoff_ms,
        max_backoff_ms: chain.retry.max_backoff_ms,
    };
    let verifier = EvmTransferVerifier::new(
        rpc.clone(),
        VerifierConfig {
            token_contract: chain.token_contract.clone(),
            treasury_address: chain.treasury_address.clone(),
        },
        retry,
    );
    let gateway_client: Arc<dyn EvmJsonRpcClient> = Arc::new(rpc);
    let gateway = EvmEscrowGateway::new(
        gateway_client,
        EscrowGatewayConfig {
            token_contract: chain.token_contract.clone(),
            signer_address: chain.signer_address.clone(),
            max_gas_price_wei: u128::from(chain.max_gas_price_wei),
            retry,
        },
    );
    BattleLifecycleManager::new(store, Arc::new(verifier), Arc::new(gateway), audit)
}

fn warn_on_unset_addresses(config: &AppConfig) {
    for (name, value) in [
        ("chain.token_contract", &config.chain.token_contract),
        ("chain.treasury_address", &config.chain.treasury_address),
        ("chain.signer_address", &config.chain.signer_address),
    ] {
        if value.trim().is_empty() || addresses_equal(value, ZERO_ADDRESS) {
            warn!(setting = name, "chain address is unset; wager settlement will fail");
        }
    }
}
