use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;

use crate::chain::codec::{codec_for, ChainCodec};
use crate::config::Config;
use crate::db::Store;
use crate::index::{IndexerCommand, TransactionPins};
use crate::node::NodeRpcClient;
use crate::observer::start_mempool_observer;
use crate::protocol::decode_transaction_pins;
use crate::utils::Context;
use crate::try_log;

/// Catch-up block scanner. Walks from the persisted cursor to the chain tip,
/// emits per-transaction events followed by a drain marker per block, then
/// keeps polling the tip. The mempool observer is fused into the same event
/// channel once the first catch-up completes.
pub struct BlockScanner {
    config: Config,
    rpc: NodeRpcClient,
    codec: Box<dyn ChainCodec + Send + Sync>,
    ctx: Context,
}

impl BlockScanner {
    pub fn new(config: &Config, ctx: &Context) -> BlockScanner {
        BlockScanner {
            config: config.clone(),
            rpc: NodeRpcClient::new(config),
            codec: codec_for(config.network.chain),
            ctx: ctx.clone(),
        }
    }

    /// `max(configured floor, persisted cursor + 1)`.
    pub fn start_height(&self, store: &Store) -> Result<u64, String> {
        let floor = self.config.init_block_height();
        let resumed = match store.get_sync_cursor(self.config.network.chain)? {
            Some(cursor) if cursor.current_sync_height >= 0 => {
                (cursor.current_sync_height as u64).saturating_add(1)
            }
            _ => 0,
        };
        Ok(floor.max(resumed))
    }

    pub async fn run(
        &self,
        store: &Store,
        commands_tx: Sender<IndexerCommand>,
        terminate: Arc<AtomicBool>,
    ) -> Result<(), String> {
        let chain = self.config.network.chain;
        let scan_interval = Duration::from_secs(self.config.indexer.scan_interval_secs);
        let mut next_height = self.start_height(store)?;
        let mut observer_started = false;
        try_log!(
            self.ctx, info,
            "Block scanner starting from height {} (chain: {})",
            next_height,
            chain
        );

        loop {
            if terminate.load(Ordering::Relaxed) {
                break;
            }
            let tip = match self.rpc.block_count().await {
                Ok(tip) => tip,
                Err(e) => {
                    try_log!(self.ctx, warn, "Unable to retrieve chain tip: {}", e);
                    tokio::time::sleep(scan_interval).await;
                    continue;
                }
            };

            while next_height <= tip {
                if terminate.load(Ordering::Relaxed) {
                    return Ok(());
                }
                match self.scan_block(next_height, &commands_tx).await {
                    Ok(pin_count) => {
                        if pin_count > 0 {
                            try_log!(
                                self.ctx, info,
                                "Block #{} drained ({} pin(s))",
                                next_height,
                                pin_count
                            );
                        } else {
                            try_log!(self.ctx, debug, "Block #{} drained", next_height);
                        }
                        let _ = commands_tx.send(IndexerCommand::BlockDrained {
                            chain,
                            height: next_height,
                        });
                        next_height += 1;
                    }
                    Err(e) => {
                        try_log!(self.ctx, warn, "Unable to scan block #{}: {}", next_height, e);
                        tokio::time::sleep(scan_interval).await;
                    }
                }
            }

            if !observer_started && self.config.is_mempool_subscription_enabled() {
                try_log!(
                    self.ctx, info,
                    "Caught up with chain tip #{}, starting mempool observer",
                    tip
                );
                start_mempool_observer(
                    &self.config,
                    commands_tx.clone(),
                    terminate.clone(),
                    &self.ctx,
                );
                observer_started = true;
            }

            tokio::time::sleep(scan_interval).await;
        }
        Ok(())
    }

    async fn scan_block(
        &self,
        height: u64,
        commands_tx: &Sender<IndexerCommand>,
    ) -> Result<usize, String> {
        let block_hash = self.rpc.block_hash(height).await?;
        let block_hex = self.rpc.block_hex(&block_hash).await?;
        let raw_block =
            hex::decode(block_hex).map_err(|e| format!("unable to decode block hex: {}", e))?;
        let block = self.codec.parse_block(&raw_block)?;
        let timestamp = block.header.time as i64 * 1000;

        let mut pin_count = 0;
        for tx in block.txdata.iter() {
            let txid = self.codec.txid(tx);
            let pins = decode_transaction_pins(tx, &txid, self.config.network.chain);
            if pins.is_empty() {
                continue;
            }
            pin_count += pins.len();
            let _ = commands_tx.send(IndexerCommand::ProcessTransaction(TransactionPins {
                chain: self.config.network.chain,
                tx_id: txid,
                pins,
                block_height: height as i64,
                timestamp,
            }));
        }
        Ok(pin_count)
    }
}
