use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use zeromq::{Socket, SocketRecv};

use crate::chain::codec::{codec_for, ChainCodec};
use crate::config::Config;
use crate::index::{IndexerCommand, TransactionPins};
use crate::protocol::decode_transaction_pins;
use crate::utils::{now_ms, Context};
use crate::try_log;

const RAWTX_TOPIC: &str = "rawtx";
pub const ZMQ_RECONNECT_DELAY_SECS: u64 = 5;

/// Subscribes to the node's `rawtx` feed and turns mempool transactions into
/// the same events the block scanner emits, with `block_height = 0`. Started
/// at most once, after the scanner first reaches the chain tip.
pub fn start_mempool_observer(
    config: &Config,
    commands_tx: Sender<IndexerCommand>,
    terminate: Arc<AtomicBool>,
    ctx: &Context,
) {
    let Some(zmq_url) = config.network.zmq_url.clone() else {
        return;
    };
    let chain = config.network.chain;
    let ctx_moved = ctx.clone();

    hiro_system_kit::thread_named("Mempool zmq observer")
        .spawn(move || {
            let codec = codec_for(chain);
            hiro_system_kit::nestable_block_on(async move {
                loop {
                    if terminate.load(Ordering::Relaxed) {
                        break;
                    }
                    let mut socket = zeromq::SubSocket::new();
                    if let Err(e) = socket.connect(&zmq_url).await {
                        try_log!(
                            ctx_moved, warn,
                            "Unable to connect to zmq socket {}: {}, will retry in {}s",
                            zmq_url,
                            e,
                            ZMQ_RECONNECT_DELAY_SECS
                        );
                        tokio::time::sleep(Duration::from_secs(ZMQ_RECONNECT_DELAY_SECS)).await;
                        continue;
                    }
                    if let Err(e) = socket.subscribe(RAWTX_TOPIC).await {
                        try_log!(ctx_moved, warn, "Unable to subscribe to {}: {}", RAWTX_TOPIC, e);
                        tokio::time::sleep(Duration::from_secs(ZMQ_RECONNECT_DELAY_SECS)).await;
                        continue;
                    }
                    try_log!(
                        ctx_moved, info,
                        "Waiting for mempool transactions from {}",
                        zmq_url
                    );

                    loop {
                        if terminate.load(Ordering::Relaxed) {
                            return;
                        }
                        let message = match socket.recv().await {
                            Ok(message) => message,
                            Err(e) => {
                                try_log!(
                                    ctx_moved, warn,
                                    "Zmq connection lost ({}), will reconnect in {}s",
                                    e,
                                    ZMQ_RECONNECT_DELAY_SECS
                                );
                                break;
                            }
                        };
                        // Frame 0 is the topic, frame 1 the raw transaction.
                        let Some(raw_tx) = message.get(1) else {
                            continue;
                        };
                        let tx = match codec.parse_tx(raw_tx) {
                            Ok(tx) => tx,
                            Err(e) => {
                                ctx_moved
                                    .try_log_internals(|l| debug!(l, "Ignoring mempool frame: {}", e));
                                continue;
                            }
                        };
                        let txid = codec.txid(&tx);
                        let pins = decode_transaction_pins(&tx, &txid, chain);
                        if pins.is_empty() {
                            continue;
                        }
                        try_log!(
                            ctx_moved, info,
                            "Mempool transaction {} carries {} pin(s)",
                            txid,
                            pins.len()
                        );
                        let _ = commands_tx.send(IndexerCommand::ProcessTransaction(
                            TransactionPins {
                                chain,
                                tx_id: txid,
                                pins,
                                block_height: 0,
                                timestamp: now_ms(),
                            },
                        ));
                    }
                    tokio::time::sleep(Duration::from_secs(ZMQ_RECONNECT_DELAY_SECS)).await;
                }
            });
        })
        .expect("unable to spawn thread");
}
