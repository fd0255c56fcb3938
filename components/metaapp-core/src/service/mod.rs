use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::Config;
use crate::db::models::SyncCursor;
use crate::db::Store;
use crate::deploy::DeployWorker;
use crate::index::{Indexer, IndexerCommand};
use crate::initialize_store;
use crate::node::NodeRpcClient;
use crate::scan::BlockScanner;
use crate::utils::{now_ms, Context};
use crate::try_log;

/// Wires the whole pipeline together: one scanner task, one deploy task and
/// the single-consumer indexer loop, all funnelled through one channel and
/// stopped by one cancellation flag.
pub struct Service {
    pub config: Config,
    pub ctx: Context,
}

impl Service {
    pub fn new(config: Config, ctx: Context) -> Self {
        Self { config, ctx }
    }

    pub fn run(&self) -> Result<(), String> {
        // Per-pin decode chatter follows the logs.indexer_internals switch.
        let ctx = Context {
            display_internals: self.config.logs.indexer_internals,
            ..self.ctx.clone()
        };
        let store = Arc::new(initialize_store(&self.config, &ctx)?);
        self.initialize_sync_cursor(&store)?;

        let terminate = Arc::new(AtomicBool::new(false));
        let (commands_tx, commands_rx) = crossbeam_channel::unbounded();

        let moved_terminate = terminate.clone();
        let moved_commands_tx = commands_tx.clone();
        let moved_ctx = self.ctx.clone();
        ctrlc::set_handler(move || {
            try_log!(moved_ctx, info, "Termination signal received");
            moved_terminate.store(true, Ordering::Relaxed);
            let _ = moved_commands_tx.send(IndexerCommand::Terminate);
        })
        .map_err(|e| format!("unable to install termination handler: {}", e))?;

        let scanner_store = store.clone();
        let scanner_config = self.config.clone();
        let scanner_ctx = ctx.clone();
        let scanner_terminate = terminate.clone();
        let scanner_commands_tx = commands_tx.clone();
        let _ = hiro_system_kit::thread_named("Block scanner runloop")
            .spawn(move || {
                let scanner = BlockScanner::new(&scanner_config, &scanner_ctx);
                let outcome = hiro_system_kit::nestable_block_on(scanner.run(
                    &scanner_store,
                    scanner_commands_tx,
                    scanner_terminate,
                ));
                if let Err(e) = outcome {
                    try_log!(scanner_ctx, error, "Block scanner runloop terminated: {}", e);
                }
            })
            .expect("unable to spawn thread");

        let deploy_store = store.clone();
        let deploy_config = self.config.clone();
        let deploy_ctx = ctx.clone();
        let deploy_terminate = terminate.clone();
        let _ = hiro_system_kit::thread_named("Deploy worker runloop")
            .spawn(move || {
                let worker = DeployWorker::new(deploy_store, &deploy_config, &deploy_ctx);
                hiro_system_kit::nestable_block_on(worker.run(deploy_terminate));
            })
            .expect("unable to spawn thread");

        // The indexer is the sole writer of the app collections and the sync
        // cursor; running it on this thread keeps the store alive until
        // every other task has wound down.
        let indexer = Indexer::new(
            store.clone(),
            Some(NodeRpcClient::new(&self.config)),
            &self.config,
            &ctx,
        );
        hiro_system_kit::nestable_block_on(indexer.run(commands_rx));
        try_log!(self.ctx, info, "Service stopped");
        Ok(())
    }

    fn initialize_sync_cursor(&self, store: &Store) -> Result<(), String> {
        let chain = self.config.network.chain;
        if let Some(cursor) = store.get_sync_cursor(chain)? {
            try_log!(
                self.ctx, info,
                "Resuming {} chain from sync height {}",
                chain,
                cursor.current_sync_height
            );
            return Ok(());
        }
        let initial_height = self.config.init_block_height() as i64 - 1;
        let now = now_ms();
        store.put_sync_cursor(&SyncCursor {
            chain_name: chain,
            current_sync_height: initial_height,
            created_at: now,
            updated_at: now,
        })?;
        try_log!(
            self.ctx, info,
            "Initialized sync status for {} chain at height {}",
            chain,
            initial_height
        );
        Ok(())
    }
}
