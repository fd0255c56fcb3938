pub mod models;

use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use rocksdb::{Direction, IteratorMode, DB};

use crate::chain::ChainKind;
use crate::try_log;
use crate::utils::{now_ms, Context};
use self::models::{DeployQueueItem, DeployResult, MetaAppRecord, SyncCursor};

const COLLECTION_PIN: &str = "metaapp_pin";
const COLLECTION_LATEST: &str = "metaapp_pin_latest";
const COLLECTION_HISTORY: &str = "metaapp_pin_history";
const COLLECTION_BY_CREATOR: &str = "metaapp_meta_timestamp";
const COLLECTION_BY_TIME: &str = "metaapp_timestamp";
const COLLECTION_DEPLOY_QUEUE: &str = "metaapp_deploy_queue";
const COLLECTION_DEPLOY_RESULT: &str = "metaapp_deploy_file_content";
const COLLECTION_SYNC_STATUS: &str = "sync_status";

/// One rocksdb sub-database per collection, all rooted under
/// `<data_dir>/indexer_db/`. Keys are text with `:` separators, values JSON,
/// so every listing is a single forward prefix scan.
pub struct Store {
    pin: DB,
    latest: DB,
    history: DB,
    by_creator: DB,
    by_time: DB,
    deploy_queue: DB,
    deploy_result: DB,
    sync_status: DB,
}

/// `(2^63 - 1) - timestamp`, zero-padded so lexicographic order equals
/// timestamp-descending.
pub fn reverse_ts(timestamp: i64) -> String {
    format!("{:019}", i64::MAX - timestamp)
}

fn collection_path(base_dir: &Path, name: &str) -> PathBuf {
    let mut path = base_dir.to_path_buf();
    path.push("indexer_db");
    path.push(name);
    path
}

fn rocks_db_default_options(ulimit: usize) -> rocksdb::Options {
    let mut opts = rocksdb::Options::default();
    opts.set_max_open_files(ulimit as i32);
    opts.create_if_missing(true);
    opts
}

// Another process (a db inspection command, a restarting service) can hold a
// collection lock for a moment; retry before treating the open as fatal.
fn open_collection(
    base_dir: &Path,
    name: &str,
    ulimit: usize,
    ctx: &Context,
) -> Result<DB, String> {
    let path = collection_path(base_dir, name);
    let opts = rocks_db_default_options(ulimit);
    let mut retries = 0;
    loop {
        match DB::open(&opts, &path) {
            Ok(db) => return Ok(db),
            Err(e) => {
                retries += 1;
                if retries > 10 {
                    return Err(format!(
                        "unable to open collection {} at {}: {}",
                        name,
                        path.display(),
                        e
                    ));
                }
                try_log!(
                    ctx, warn,
                    "Unable to open collection {}: {}. Retrying in 2s",
                    name,
                    e
                );
                sleep(Duration::from_secs(2));
            }
        }
    }
}

impl Store {
    pub fn open(base_dir: &Path, ulimit: usize, ctx: &Context) -> Result<Store, String> {
        std::fs::create_dir_all(base_dir)
            .map_err(|e| format!("unable to create data directory {}: {}", base_dir.display(), e))?;
        let store = Store {
            pin: open_collection(base_dir, COLLECTION_PIN, ulimit, ctx)?,
            latest: open_collection(base_dir, COLLECTION_LATEST, ulimit, ctx)?,
            history: open_collection(base_dir, COLLECTION_HISTORY, ulimit, ctx)?,
            by_creator: open_collection(base_dir, COLLECTION_BY_CREATOR, ulimit, ctx)?,
            by_time: open_collection(base_dir, COLLECTION_BY_TIME, ulimit, ctx)?,
            deploy_queue: open_collection(base_dir, COLLECTION_DEPLOY_QUEUE, ulimit, ctx)?,
            deploy_result: open_collection(base_dir, COLLECTION_DEPLOY_RESULT, ulimit, ctx)?,
            sync_status: open_collection(base_dir, COLLECTION_SYNC_STATUS, ulimit, ctx)?,
        };
        try_log!(
            ctx, debug,
            "Indexer store opened under {}",
            collection_path(base_dir, "").display()
        );
        Ok(store)
    }

    // MetaApp records

    /// Writes one version through every index collection. Stale `by_creator`
    /// and `by_time` entries sharing the record's logical app are removed
    /// first so each collection keeps exactly one entry per `first_pin_id`.
    pub fn insert_record(&self, record: &MetaAppRecord) -> Result<(), String> {
        let mut record = record.clone();
        if record.first_pin_id.is_empty() {
            record.first_pin_id = record.pin_id.clone();
        }
        let data = serialize(&record)?;

        put(&self.pin, &record.pin_id, &data)?;
        self.update_latest(&record, &data)?;
        self.append_history(&record)?;

        let new_creator_key = format!(
            "{}:{}:{}",
            record.creator_meta_id,
            reverse_ts(record.timestamp),
            record.first_pin_id
        );
        let creator_prefix = format!("{}:", record.creator_meta_id);
        for (key, _) in scan_prefix(&self.by_creator, &creator_prefix) {
            if key != new_creator_key && key.ends_with(&format!(":{}", record.first_pin_id)) {
                delete(&self.by_creator, &key)?;
            }
        }
        put(&self.by_creator, &new_creator_key, &data)?;

        let new_time_key = format!("{}:{}", reverse_ts(record.timestamp), record.first_pin_id);
        for (key, _) in scan_prefix(&self.by_time, "") {
            if key != new_time_key && key.ends_with(&format!(":{}", record.first_pin_id)) {
                delete(&self.by_time, &key)?;
            }
        }
        put(&self.by_time, &new_time_key, &data)?;

        Ok(())
    }

    fn update_latest(&self, record: &MetaAppRecord, data: &[u8]) -> Result<(), String> {
        if let Some(existing) = self.latest_record(&record.first_pin_id)? {
            // A replayed older version never demotes the head.
            if existing.timestamp > record.timestamp && existing.pin_id != record.pin_id {
                return Ok(());
            }
        }
        put(&self.latest, &record.first_pin_id, data)
    }

    fn append_history(&self, record: &MetaAppRecord) -> Result<(), String> {
        let mut history = self.history(&record.first_pin_id)?;
        history.retain(|entry| entry.pin_id != record.pin_id);
        history.push(record.clone());
        history.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.pin_id.cmp(&a.pin_id))
        });
        let data = serialize(&history)?;
        put(&self.history, &record.first_pin_id, &data)
    }

    pub fn get_record(&self, pin_id: &str) -> Result<Option<MetaAppRecord>, String> {
        get(&self.pin, pin_id)
    }

    pub fn latest_record(&self, first_pin_id: &str) -> Result<Option<MetaAppRecord>, String> {
        get(&self.latest, first_pin_id)
    }

    pub fn history(&self, first_pin_id: &str) -> Result<Vec<MetaAppRecord>, String> {
        Ok(get::<Vec<MetaAppRecord>>(&self.history, first_pin_id)?.unwrap_or_default())
    }

    /// Number of logical apps (unique `first_pin_id`).
    pub fn count_apps(&self) -> Result<u64, String> {
        Ok(scan_prefix(&self.latest, "").len() as u64)
    }

    pub fn list_by_creator(
        &self,
        creator_meta_id: &str,
        cursor: i64,
        size: usize,
    ) -> Result<(Vec<MetaAppRecord>, i64), String> {
        let prefix = format!("{}:", creator_meta_id);
        let mut records = dedupe_by_app(decode_records(scan_prefix(&self.by_creator, &prefix)));
        sort_newest_first(&mut records);
        Ok(paginate(records, cursor, size))
    }

    pub fn list_by_time(
        &self,
        cursor: i64,
        size: usize,
    ) -> Result<(Vec<MetaAppRecord>, i64), String> {
        let mut records = dedupe_by_app(decode_records(scan_prefix(&self.by_time, "")));
        sort_newest_first(&mut records);
        Ok(paginate(records, cursor, size))
    }

    // Deploy queue

    /// Returns `false` when an entry for the same pin is already queued.
    pub fn enqueue_deploy(&self, item: &DeployQueueItem) -> Result<bool, String> {
        if self.get_queue_item(&item.pin_id)?.is_some() {
            return Ok(false);
        }
        let key = format!("{}:{}", reverse_ts(item.timestamp), item.pin_id);
        put(&self.deploy_queue, &key, &serialize(item)?)?;
        Ok(true)
    }

    /// The oldest enqueued item by original block time. Keys are
    /// reverse-timestamped, so FIFO order reads from the back.
    pub fn peek_next_deploy(&self) -> Result<Option<DeployQueueItem>, String> {
        let mut iter = self.deploy_queue.iterator(IteratorMode::End);
        match iter.next() {
            Some(Ok((_, value))) => Ok(Some(deserialize(&value)?)),
            Some(Err(e)) => Err(format!("unable to read deploy queue: {}", e)),
            None => Ok(None),
        }
    }

    pub fn get_queue_item(&self, pin_id: &str) -> Result<Option<DeployQueueItem>, String> {
        for (_, value) in scan_prefix(&self.deploy_queue, "") {
            let item: DeployQueueItem = deserialize(&value)?;
            if item.pin_id == pin_id {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    pub fn update_queue_item(&self, item: &DeployQueueItem) -> Result<(), String> {
        for (key, value) in scan_prefix(&self.deploy_queue, "") {
            let existing: DeployQueueItem = deserialize(&value)?;
            if existing.pin_id == item.pin_id {
                return put(&self.deploy_queue, &key, &serialize(item)?);
            }
        }
        Err(format!("deploy queue has no entry for {}", item.pin_id))
    }

    pub fn remove_from_queue(&self, pin_id: &str) -> Result<(), String> {
        for (key, value) in scan_prefix(&self.deploy_queue, "") {
            let existing: DeployQueueItem = deserialize(&value)?;
            if existing.pin_id == pin_id {
                return delete(&self.deploy_queue, &key);
            }
        }
        Err(format!("deploy queue has no entry for {}", pin_id))
    }

    pub fn list_queue(
        &self,
        cursor: i64,
        size: usize,
    ) -> Result<(Vec<DeployQueueItem>, i64), String> {
        let mut items = vec![];
        for (_, value) in scan_prefix(&self.deploy_queue, "") {
            items.push(deserialize::<DeployQueueItem>(&value)?);
        }
        items.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.pin_id.cmp(&a.pin_id))
        });
        Ok(paginate(items, cursor, size))
    }

    // Deploy results

    pub fn put_deploy_result(&self, result: &DeployResult) -> Result<(), String> {
        put(&self.deploy_result, &result.pin_id, &serialize(result)?)
    }

    pub fn get_deploy_result(&self, pin_id: &str) -> Result<Option<DeployResult>, String> {
        get(&self.deploy_result, pin_id)
    }

    // Sync cursor

    pub fn get_sync_cursor(&self, chain: ChainKind) -> Result<Option<SyncCursor>, String> {
        get(&self.sync_status, chain.as_str())
    }

    pub fn put_sync_cursor(&self, cursor: &SyncCursor) -> Result<(), String> {
        put(
            &self.sync_status,
            cursor.chain_name.as_str(),
            &serialize(cursor)?,
        )
    }

    pub fn update_sync_height(&self, chain: ChainKind, height: i64) -> Result<(), String> {
        let mut cursor = self
            .get_sync_cursor(chain)?
            .ok_or_else(|| format!("sync status missing for chain {}", chain))?;
        cursor.current_sync_height = height;
        cursor.updated_at = now_ms();
        self.put_sync_cursor(&cursor)
    }

    pub fn get_all_sync_cursors(&self) -> Result<Vec<SyncCursor>, String> {
        let mut cursors = vec![];
        for (_, value) in scan_prefix(&self.sync_status, "") {
            cursors.push(deserialize::<SyncCursor>(&value)?);
        }
        Ok(cursors)
    }
}

fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, String> {
    serde_json::to_vec(value).map_err(|e| format!("unable to serialize value: {}", e))
}

fn deserialize<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, String> {
    serde_json::from_slice(bytes).map_err(|e| format!("unable to deserialize value: {}", e))
}

fn put(db: &DB, key: &str, value: &[u8]) -> Result<(), String> {
    db.put(key.as_bytes(), value)
        .map_err(|e| format!("unable to write key {}: {}", key, e))
}

fn delete(db: &DB, key: &str) -> Result<(), String> {
    db.delete(key.as_bytes())
        .map_err(|e| format!("unable to delete key {}: {}", key, e))
}

fn get<T: serde::de::DeserializeOwned>(db: &DB, key: &str) -> Result<Option<T>, String> {
    match db.get(key.as_bytes()) {
        Ok(Some(bytes)) => Ok(Some(deserialize(&bytes)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(format!("unable to read key {}: {}", key, e)),
    }
}

fn scan_prefix(db: &DB, prefix: &str) -> Vec<(String, Vec<u8>)> {
    let mut entries = vec![];
    let iter = db.iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));
    for item in iter {
        let Ok((key, value)) = item else {
            break;
        };
        if !key.starts_with(prefix.as_bytes()) {
            break;
        }
        entries.push((String::from_utf8_lossy(&key).into_owned(), value.to_vec()));
    }
    entries
}

fn decode_records(entries: Vec<(String, Vec<u8>)>) -> Vec<MetaAppRecord> {
    entries
        .into_iter()
        .filter_map(|(_, value)| serde_json::from_slice(&value).ok())
        .collect()
}

/// Keeps the max-timestamp representative per logical app.
fn dedupe_by_app(records: Vec<MetaAppRecord>) -> Vec<MetaAppRecord> {
    let mut newest: std::collections::HashMap<String, MetaAppRecord> =
        std::collections::HashMap::new();
    for record in records {
        let key = if record.first_pin_id.is_empty() {
            record.pin_id.clone()
        } else {
            record.first_pin_id.clone()
        };
        match newest.get(&key) {
            Some(existing) if existing.timestamp >= record.timestamp => {}
            _ => {
                newest.insert(key, record);
            }
        }
    }
    newest.into_values().collect()
}

fn sort_newest_first(records: &mut [MetaAppRecord]) {
    records.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| b.pin_id.cmp(&a.pin_id))
    });
}

fn paginate<T>(items: Vec<T>, cursor: i64, size: usize) -> (Vec<T>, i64) {
    let cursor = cursor.max(0);
    let start = cursor as usize;
    if size == 0 || start >= items.len() {
        return (vec![], cursor);
    }
    let page: Vec<T> = items.into_iter().skip(start).take(size).collect();
    let next_cursor = cursor + page.len() as i64;
    (page, next_cursor)
}
