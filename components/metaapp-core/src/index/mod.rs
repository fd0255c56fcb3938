use std::collections::HashSet;
use std::sync::Arc;

use bitcoin::hashes::{sha256, Hash};
use crossbeam_channel::Receiver;

use crate::chain::codec::{codec_for, ChainCodec};
use crate::chain::{address_from_output_script, ChainKind};
use crate::config::Config;
use crate::db::models::{DeployQueueItem, MetaAppRecord, PinOperation};
use crate::db::Store;
use crate::node::NodeRpcClient;
use crate::protocol::payload::parse_metaapp_payload;
use crate::protocol::{extract_parent_pin_id, is_metaapp_path, DecodedPin};
use crate::utils::{ensure_millisecond_timestamp, now_ms, Context};
use crate::try_log;

/// Commands funnelled into the single-consumer ingest channel. Scanner and
/// mempool observer both feed it; the indexer drains it in strict FIFO
/// order, which makes the check-walk-write sequence atomic without per-key
/// locks.
pub enum IndexerCommand {
    ProcessTransaction(TransactionPins),
    BlockDrained { chain: ChainKind, height: u64 },
    Terminate,
}

pub struct TransactionPins {
    pub chain: ChainKind,
    pub tx_id: String,
    pub pins: Vec<DecodedPin>,
    /// 0 for mempool sightings.
    pub block_height: i64,
    pub timestamp: i64,
}

pub struct Indexer {
    store: Arc<Store>,
    /// Absent in tests; creator resolution then falls back to the decoder's
    /// owner address.
    rpc: Option<NodeRpcClient>,
    codec: Box<dyn ChainCodec + Send + Sync>,
    config: Config,
    ctx: Context,
}

impl Indexer {
    pub fn new(store: Arc<Store>, rpc: Option<NodeRpcClient>, config: &Config, ctx: &Context) -> Indexer {
        Indexer {
            store,
            rpc,
            codec: codec_for(config.network.chain),
            config: config.clone(),
            ctx: ctx.clone(),
        }
    }

    pub async fn run(&self, commands_rx: Receiver<IndexerCommand>) {
        while let Ok(command) = commands_rx.recv() {
            match command {
                IndexerCommand::Terminate => {
                    try_log!(self.ctx, info, "Terminating indexer runloop");
                    break;
                }
                IndexerCommand::BlockDrained { chain, height } => {
                    if let Err(e) = self.store.update_sync_height(chain, height as i64) {
                        try_log!(self.ctx, error, "Unable to update sync cursor: {}", e);
                    }
                }
                IndexerCommand::ProcessTransaction(event) => {
                    self.process_transaction(&event).await;
                }
            }
        }
    }

    pub async fn process_transaction(&self, event: &TransactionPins) {
        for pin in event.pins.iter() {
            match self.process_pin(event, pin).await {
                Ok(Some(record)) => {
                    try_log!(
                        self.ctx, info,
                        "MetaApp {} indexed: pin={} title={} version={} height={}",
                        record.operation.as_str(),
                        record.pin_id,
                        record.title,
                        record.version,
                        record.block_height
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    try_log!(self.ctx, warn, "Skipping pin {}: {}", pin.pin_id, e);
                }
            }
        }
    }

    /// Runs one decoded pin through classification, de-duplication, ancestor
    /// resolution and persistence. `Ok(None)` means the pin was not a
    /// MetaApp (or a pure duplicate); `Err` skips this pin only.
    async fn process_pin(
        &self,
        event: &TransactionPins,
        pin: &DecodedPin,
    ) -> Result<Option<MetaAppRecord>, String> {
        let (is_metaapp, is_pin_reference) = is_metaapp_path(&pin.path);
        if !is_metaapp {
            return Ok(None);
        }
        let operation = PinOperation::from_tag(&pin.operation)
            .ok_or_else(|| format!("unrecognised operation '{}'", pin.operation))?;

        if let Some(existing) = self.store.get_record(&pin.pin_id)? {
            // Confirmation of a mempool sighting: the higher height wins and
            // the confirmed payload overwrites the rest.
            if existing.block_height < event.block_height && event.block_height > 0 {
                let first_pin_id = existing.first_pin_id.clone();
                let mut confirmed = self
                    .build_record(event, pin, operation, first_pin_id)
                    .await?;
                confirmed.created_at = existing.created_at;
                self.store.insert_record(&confirmed)?;
                self.ctx.try_log_internals(|l| {
                    debug!(l, "Pin {} confirmed at height {}", pin.pin_id, event.block_height)
                });
            }
            return Ok(None);
        }

        let record = match operation {
            PinOperation::Create if is_pin_reference => return Ok(None),
            PinOperation::Create => {
                let record = self
                    .build_record(event, pin, operation, pin.pin_id.clone())
                    .await?;
                self.store.insert_record(&record)?;
                self.enqueue_deploy(&record)?;
                record
            }
            PinOperation::Modify => {
                let parent = extract_parent_pin_id(&pin.path)
                    .ok_or_else(|| "modify path carries no parent reference".to_string())?;
                let first_pin_id = self.resolve_first_pin_id(&parent)?;
                let record = self.build_record(event, pin, operation, first_pin_id).await?;
                self.store.insert_record(&record)?;
                self.enqueue_deploy(&record)?;
                record
            }
            PinOperation::Revoke => {
                // A revoke only flips the latest marker to disabled; nothing
                // gets deployed for it.
                let first_pin_id = match extract_parent_pin_id(&pin.path) {
                    Some(parent) => self.resolve_first_pin_id(&parent)?,
                    None => pin.pin_id.clone(),
                };
                let mut record = self.build_record(event, pin, operation, first_pin_id).await?;
                record.disabled = true;
                self.store.insert_record(&record)?;
                record
            }
        };
        Ok(Some(record))
    }

    /// Walks parent references up to the root `create`. Iterative on
    /// purpose: the depth cap is one comparison and the visited set refuses
    /// cycles. A missing hop aborts the walk — the ancestor may simply not
    /// have been ingested yet and the modify will come back on redelivery.
    fn resolve_first_pin_id(&self, parent_pin_id: &str) -> Result<String, String> {
        let mut current = parent_pin_id.to_string();
        let mut visited: HashSet<String> = HashSet::new();
        loop {
            if visited.len() > self.config.indexer.max_ancestor_depth {
                return Err(format!(
                    "ancestor walk exceeded depth {} at {}",
                    self.config.indexer.max_ancestor_depth, current
                ));
            }
            if !visited.insert(current.clone()) {
                return Err(format!("circular reference detected at {}", current));
            }
            let record = self
                .store
                .get_record(&current)?
                .ok_or_else(|| format!("ancestor {} not indexed yet", current))?;
            match record.operation {
                PinOperation::Create => {
                    return Ok(if record.first_pin_id.is_empty() {
                        record.pin_id
                    } else {
                        record.first_pin_id
                    });
                }
                PinOperation::Modify => {
                    if !record.first_pin_id.is_empty() && record.first_pin_id != current {
                        current = record.first_pin_id;
                    } else if let Some(next) = extract_parent_pin_id(&record.path) {
                        if next == current {
                            return Err(format!("modify {} references itself", current));
                        }
                        current = next;
                    } else {
                        // A stored modify pointing nowhere but itself is
                        // corrupt; refusing beats inventing a
                        // self-referential app.
                        return Err(format!("stored modify {} has no ancestor reference", current));
                    }
                }
                PinOperation::Revoke => {
                    return Ok(if record.first_pin_id.is_empty() {
                        record.pin_id
                    } else {
                        record.first_pin_id
                    });
                }
            }
        }
    }

    async fn build_record(
        &self,
        event: &TransactionPins,
        pin: &DecodedPin,
        operation: PinOperation,
        first_pin_id: String,
    ) -> Result<MetaAppRecord, String> {
        let creator_address = self.resolve_creator_address(pin).await;
        let payload = parse_metaapp_payload(&pin.content_bytes)?;
        let timestamp = ensure_millisecond_timestamp(event.timestamp);
        let now = now_ms();

        Ok(MetaAppRecord {
            first_pin_id,
            pin_id: pin.pin_id.clone(),
            tx_id: event.tx_id.clone(),
            vout: pin.vout,
            path: pin.path.clone(),
            operation,
            parent_path: pin.parent_path.clone(),
            title: payload.title,
            app_name: payload.app_name,
            prompt: payload.prompt,
            icon: payload.icon,
            cover_img: payload.cover_img,
            intro_imgs: payload.intro_imgs,
            intro: payload.intro,
            runtime: payload.runtime,
            index_file: payload.index_file,
            version: payload.version,
            content_type: payload.content_type,
            content: payload.content,
            code: payload.code,
            content_hash: payload.content_hash,
            metadata: payload.metadata,
            disabled: payload.disabled,
            chain_name: event.chain,
            block_height: event.block_height,
            timestamp,
            creator_meta_id: calculate_meta_id(&creator_address),
            creator_address,
            owner_meta_id: calculate_meta_id(&pin.owner_address),
            owner_address: pin.owner_address.clone(),
            status: 1,
            state: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// One `getrawtransaction` round-trip to the output the first input
    /// spends. Failure falls back to whatever the decoder extracted.
    async fn resolve_creator_address(&self, pin: &DecodedPin) -> String {
        let fallback = pin.owner_address.clone();
        let Some(ref rpc) = self.rpc else {
            return fallback;
        };
        if pin.creator_input_location.is_empty() {
            return fallback;
        }
        match self.fetch_input_address(rpc, &pin.creator_input_location).await {
            Ok(address) => address,
            Err(e) => {
                try_log!(
                    self.ctx, warn,
                    "Unable to resolve creator address from {}: {}",
                    pin.creator_input_location,
                    e
                );
                fallback
            }
        }
    }

    async fn fetch_input_address(
        &self,
        rpc: &NodeRpcClient,
        location: &str,
    ) -> Result<String, String> {
        let (txid, vout) = location
            .split_once(':')
            .ok_or_else(|| format!("invalid creator input location '{}'", location))?;
        let vout: usize = vout
            .parse()
            .map_err(|_| format!("invalid vout in creator input location '{}'", location))?;
        let raw = hex::decode(rpc.raw_tx_hex(txid).await?)
            .map_err(|e| format!("unable to decode transaction hex: {}", e))?;
        let prev_tx = self.codec.parse_tx(&raw)?;
        let output = prev_tx
            .output
            .get(vout)
            .ok_or_else(|| format!("output index {} out of range", vout))?;
        address_from_output_script(&output.script_pubkey)
    }

    fn enqueue_deploy(&self, record: &MetaAppRecord) -> Result<(), String> {
        let Some(artifact) = deploy_artifact_reference(record) else {
            self.ctx.try_log_internals(|l| {
                debug!(l, "No code or content reference for {}, skipping deploy", record.pin_id)
            });
            return Ok(());
        };
        let item = DeployQueueItem {
            first_pin_id: record.first_pin_id.clone(),
            pin_id: record.pin_id.clone(),
            timestamp: record.timestamp,
            content: record.content.clone(),
            code: artifact,
            content_type: record.content_type.clone(),
            version: record.version.clone(),
            try_count: 0,
            created_at: now_ms(),
        };
        if !self.store.enqueue_deploy(&item)? {
            self.ctx
                .try_log_internals(|l| debug!(l, "Deploy already queued for {}", record.pin_id));
        }
        Ok(())
    }
}

pub fn calculate_meta_id(address: &str) -> String {
    if address.is_empty() {
        return String::new();
    }
    hex::encode(sha256::Hash::hash(address.as_bytes()).to_byte_array())
}

/// The artifact to deploy: the payload's `code` field when present, else its
/// `content` field normalised to a `metafile://` reference.
pub fn deploy_artifact_reference(record: &MetaAppRecord) -> Option<String> {
    if !record.code.is_empty() {
        return Some(record.code.clone());
    }
    if !record.content.is_empty() {
        if record.content.starts_with("metafile://") {
            return Some(record.content.clone());
        }
        return Some(format!("metafile://{}", record.content));
    }
    None
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::{calculate_meta_id, Indexer, TransactionPins};
    use crate::chain::ChainKind;
    use crate::config::Config;
    use crate::db::models::PinOperation;
    use crate::db::test::{open_test_store, record};
    use crate::db::Store;
    use crate::protocol::DecodedPin;
    use crate::utils::Context;

    fn test_indexer() -> (TempDir, Arc<Store>, Indexer) {
        let (dir, store) = open_test_store();
        let store = Arc::new(store);
        let mut config = Config::devnet_default();
        config.network.chain = ChainKind::Mvc;
        let indexer = Indexer::new(store.clone(), None, &config, &Context::empty());
        (dir, store, indexer)
    }

    fn pin_id(seed: char, vout: u32) -> String {
        format!("{}i{}", seed.to_string().repeat(64), vout)
    }

    fn decoded_pin(id: &str, operation: &str, path: &str, payload: &str) -> DecodedPin {
        DecodedPin {
            pin_id: id.to_string(),
            vout: 0,
            operation: operation.to_string(),
            original_path: path.to_string(),
            host: String::new(),
            path: path.to_string(),
            parent_path: String::new(),
            encryption: "0".to_string(),
            version: "1.0.0".to_string(),
            content_type: "application/json".to_string(),
            content_bytes: payload.as_bytes().to_vec(),
            owner_address: "1OwnerAddress".to_string(),
            creator_input_location: String::new(),
            chain: ChainKind::Mvc,
        }
    }

    fn event(pin: DecodedPin, height: i64, timestamp: i64) -> TransactionPins {
        TransactionPins {
            chain: ChainKind::Mvc,
            tx_id: pin.pin_id.split('i').next().unwrap().to_string(),
            pins: vec![pin],
            block_height: height,
            timestamp,
        }
    }

    fn ingest(indexer: &Indexer, event: TransactionPins) {
        hiro_system_kit::nestable_block_on(indexer.process_transaction(&event));
    }

    #[test]
    fn create_is_persisted_and_enqueued() {
        let (_dir, store, indexer) = test_indexer();
        let p0 = pin_id('a', 0);
        let payload = r#"{"title":"demo","code":"metafile://artifact","version":"v1"}"#;
        ingest(
            &indexer,
            event(
                decoded_pin(&p0, "create", "/protocols/metaapp", payload),
                100,
                1_700_000_000_000,
            ),
        );

        let record = store.get_record(&p0).unwrap().unwrap();
        assert_eq!(record.operation, PinOperation::Create);
        assert_eq!(record.first_pin_id, p0);
        assert_eq!(record.status, 1);
        assert_eq!(
            record.creator_meta_id,
            calculate_meta_id("1OwnerAddress")
        );
        assert_eq!(store.latest_record(&p0).unwrap().unwrap(), record);
        assert_eq!(store.get_queue_item(&p0).unwrap().unwrap().code, "metafile://artifact");
    }

    #[test]
    fn modify_resolves_the_root_create() {
        let (_dir, store, indexer) = test_indexer();
        let p0 = pin_id('a', 0);
        let p1 = pin_id('b', 0);
        let p2 = pin_id('c', 0);
        ingest(
            &indexer,
            event(
                decoded_pin(&p0, "create", "/protocols/metaapp", r#"{"title":"v1"}"#),
                100,
                1_700_000_000_000,
            ),
        );
        ingest(
            &indexer,
            event(
                decoded_pin(&p1, "modify", &format!("@{}", p0), r#"{"title":"v2"}"#),
                110,
                1_700_000_600_000,
            ),
        );
        // A second-level modify resolves through the intermediate version.
        ingest(
            &indexer,
            event(
                decoded_pin(&p2, "modify", &format!("@{}", p1), r#"{"title":"v3"}"#),
                120,
                1_700_001_200_000,
            ),
        );

        let history = store.history(&p0).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].pin_id, p2);
        assert_eq!(store.latest_record(&p0).unwrap().unwrap().pin_id, p2);
        let (by_time, _) = store.list_by_time(0, 10).unwrap();
        assert_eq!(by_time.len(), 1);
        assert_eq!(by_time[0].pin_id, p2);
    }

    #[test]
    fn orphan_modify_is_skipped() {
        let (_dir, store, indexer) = test_indexer();
        let p2 = pin_id('e', 0);
        let unknown = pin_id('f', 0);
        ingest(
            &indexer,
            event(
                decoded_pin(&p2, "modify", &format!("@{}", unknown), r#"{"title":"x"}"#),
                100,
                1_700_000_000_000,
            ),
        );
        assert!(store.get_record(&p2).unwrap().is_none());
        assert!(store.get_queue_item(&p2).unwrap().is_none());
    }

    #[test]
    fn circular_modify_graph_is_refused() {
        let (_dir, store, indexer) = test_indexer();
        let pa = pin_id('a', 1);
        let pb = pin_id('b', 1);
        let pc = pin_id('c', 1);
        let mut seed_a = record(&pa, "", 1000);
        seed_a.operation = PinOperation::Modify;
        seed_a.path = format!("@{}", pb);
        seed_a.first_pin_id = String::new();
        let mut seed_b = record(&pb, "", 2000);
        seed_b.operation = PinOperation::Modify;
        seed_b.path = format!("@{}", pa);
        seed_b.first_pin_id = String::new();
        store.insert_record(&seed_a).unwrap();
        store.insert_record(&seed_b).unwrap();

        // The seeds carry only @-path references, so the walk has to chase
        // pa -> pb -> pa and trip the visited set.
        ingest(
            &indexer,
            event(
                decoded_pin(&pc, "modify", &format!("@{}", pa), r#"{"title":"x"}"#),
                100,
                1_700_000_000_000,
            ),
        );
        assert!(store.get_record(&pc).unwrap().is_none());
    }

    #[test]
    fn mempool_sighting_is_confirmed_without_duplicates() {
        let (_dir, store, indexer) = test_indexer();
        let p0 = pin_id('d', 0);
        let payload = r#"{"title":"demo","code":"metafile://artifact"}"#;
        ingest(
            &indexer,
            event(
                decoded_pin(&p0, "create", "/protocols/metaapp", payload),
                0,
                1_700_000_000_000,
            ),
        );
        assert_eq!(store.get_record(&p0).unwrap().unwrap().block_height, 0);

        ingest(
            &indexer,
            event(
                decoded_pin(&p0, "create", "/protocols/metaapp", payload),
                501,
                1_700_000_000_000,
            ),
        );
        let confirmed = store.get_record(&p0).unwrap().unwrap();
        assert_eq!(confirmed.block_height, 501);
        assert_eq!(store.history(&p0).unwrap().len(), 1);
        let (queue, _) = store.list_queue(0, 10).unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn lower_height_replay_is_dropped() {
        let (_dir, store, indexer) = test_indexer();
        let p0 = pin_id('d', 2);
        let payload = r#"{"title":"demo"}"#;
        ingest(
            &indexer,
            event(
                decoded_pin(&p0, "create", "/protocols/metaapp", payload),
                501,
                1_700_000_000_000,
            ),
        );
        ingest(
            &indexer,
            event(
                decoded_pin(&p0, "create", "/protocols/metaapp", payload),
                0,
                1_700_000_999_000,
            ),
        );
        assert_eq!(store.get_record(&p0).unwrap().unwrap().block_height, 501);
    }

    #[test]
    fn second_precision_timestamps_are_normalised() {
        let (_dir, store, indexer) = test_indexer();
        let p0 = pin_id('e', 3);
        ingest(
            &indexer,
            event(
                decoded_pin(&p0, "create", "/protocols/metaapp", r#"{"title":"x"}"#),
                100,
                1_700_000_000,
            ),
        );
        assert_eq!(
            store.get_record(&p0).unwrap().unwrap().timestamp,
            1_700_000_000_000
        );
    }

    #[test]
    fn revoke_disables_the_latest_marker() {
        let (_dir, store, indexer) = test_indexer();
        let p0 = pin_id('a', 4);
        let p1 = pin_id('b', 4);
        ingest(
            &indexer,
            event(
                decoded_pin(&p0, "create", "/protocols/metaapp", r#"{"title":"x"}"#),
                100,
                1_700_000_000_000,
            ),
        );
        ingest(
            &indexer,
            event(
                decoded_pin(&p1, "revoke", &format!("@{}", p0), r#"{"title":"x"}"#),
                110,
                1_700_000_600_000,
            ),
        );
        let latest = store.latest_record(&p0).unwrap().unwrap();
        assert_eq!(latest.pin_id, p1);
        assert!(latest.disabled);
        assert!(store.get_queue_item(&p1).unwrap().is_none());
    }

    #[test]
    fn malformed_payload_or_operation_skips_the_pin() {
        let (_dir, store, indexer) = test_indexer();
        let p0 = pin_id('f', 5);
        ingest(
            &indexer,
            event(
                decoded_pin(&p0, "create", "/protocols/metaapp", "{broken"),
                100,
                1_700_000_000_000,
            ),
        );
        assert!(store.get_record(&p0).unwrap().is_none());

        ingest(
            &indexer,
            event(
                decoded_pin(&p0, "transfer", "/protocols/metaapp", r#"{"title":"x"}"#),
                100,
                1_700_000_000_000,
            ),
        );
        assert!(store.get_record(&p0).unwrap().is_none());
    }

    #[test]
    fn non_metaapp_paths_are_ignored() {
        let (_dir, store, indexer) = test_indexer();
        let p0 = pin_id('a', 6);
        ingest(
            &indexer,
            event(
                decoded_pin(&p0, "create", "/protocols/simplebuzz", r#"{"title":"x"}"#),
                100,
                1_700_000_000_000,
            ),
        );
        assert!(store.get_record(&p0).unwrap().is_none());
        assert_eq!(store.count_apps().unwrap(), 0);
    }

    #[test]
    fn inscribed_transaction_is_indexed_end_to_end() {
        use crate::chain::codec::{ChainCodec, MvcCodec};
        use crate::protocol::test::{inscription_script, inscription_transaction};
        use crate::protocol::decode_transaction_pins;

        let (_dir, store, indexer) = test_indexer();
        let payload = br#"{"title":"demo","code":"metafile://artifact","runtime":"browser"}"#;
        let script = inscription_script("create", "/protocols/metaapp", "application/json", payload);
        let tx = inscription_transaction(script);
        let txid = MvcCodec.txid(&tx);
        let pins = decode_transaction_pins(&tx, &txid, ChainKind::Mvc);
        assert_eq!(pins.len(), 1);

        ingest(
            &indexer,
            TransactionPins {
                chain: ChainKind::Mvc,
                tx_id: txid.clone(),
                pins,
                block_height: 840_000,
                timestamp: 1_700_000_000_000,
            },
        );

        let record = store
            .get_record(&format!("{}i0", txid))
            .unwrap()
            .unwrap();
        assert_eq!(record.tx_id, txid);
        assert_eq!(record.title, "demo");
        assert_eq!(record.runtime, "browser");
        assert_eq!(record.block_height, 840_000);
        assert_eq!(
            store.get_queue_item(&record.pin_id).unwrap().unwrap().code,
            "metafile://artifact"
        );
    }

    #[test]
    fn content_reference_gets_metafile_prefix() {
        let (_dir, store, indexer) = test_indexer();
        let p0 = pin_id('b', 7);
        let bare = "9".repeat(64) + "i0";
        let payload = format!(r#"{{"title":"x","content":"{}"}}"#, bare);
        ingest(
            &indexer,
            event(
                decoded_pin(&p0, "create", "/protocols/metaapp", &payload),
                100,
                1_700_000_000_000,
            ),
        );
        let item = store.get_queue_item(&p0).unwrap().unwrap();
        assert_eq!(item.code, format!("metafile://{}", bare));
    }
}
