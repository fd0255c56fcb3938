pub mod content_store;

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use zip::ZipArchive;

use crate::config::Config;
use crate::db::models::{DeployQueueItem, DeployResult, DeployStatus};
use crate::db::Store;
use crate::index::deploy_artifact_reference;
use crate::utils::{now_ms, Context};
use crate::try_log;
use self::content_store::{ContentStoreClient, FileMetadata};

lazy_static! {
    static ref METAFILE_REF_REGEX: Regex =
        Regex::new(r#"^metafile://[0-9a-f]{64}i\d+$"#).unwrap();
}

/// Long-running worker draining the deploy queue, one item per tick, oldest
/// enqueue timestamp first. Sole writer of the filesystem under the deploy
/// base directory.
pub struct DeployWorker {
    store: Arc<Store>,
    content_store: ContentStoreClient,
    config: Config,
    ctx: Context,
}

impl DeployWorker {
    pub fn new(store: Arc<Store>, config: &Config, ctx: &Context) -> DeployWorker {
        DeployWorker {
            store,
            content_store: ContentStoreClient::new(config),
            config: config.clone(),
            ctx: ctx.clone(),
        }
    }

    pub async fn run(&self, terminate: Arc<AtomicBool>) {
        let tick = Duration::from_secs(self.config.deploy.tick_secs);
        try_log!(self.ctx, info, "Deploy worker started");
        loop {
            if terminate.load(Ordering::Relaxed) {
                break;
            }
            if let Err(e) = self.process_next_item().await {
                try_log!(self.ctx, warn, "Unable to process deploy queue: {}", e);
            }
            tokio::time::sleep(tick).await;
        }
    }

    /// Returns `true` when an item was pulled from the queue.
    pub async fn process_next_item(&self) -> Result<bool, String> {
        let Some(item) = self.store.peek_next_deploy()? else {
            return Ok(false);
        };
        try_log!(
            self.ctx, info,
            "Processing deploy queue item: pin={} code={} try_count={}",
            item.pin_id,
            item.code,
            item.try_count
        );
        self.write_result(&item, DeployStatus::Processing, "", "")?;

        match self.deploy_item(&item).await {
            Ok(deploy_root) => {
                self.store.remove_from_queue(&item.pin_id)?;
                self.write_result(&item, DeployStatus::Completed, &deploy_root, "")?;
                try_log!(self.ctx, info, "MetaApp deployed: pin={}", item.pin_id);
            }
            Err(message) => {
                try_log!(
                    self.ctx, warn,
                    "Unable to deploy {}: {}",
                    item.pin_id,
                    message
                );
                self.record_failure(&item, &message)?;
            }
        }
        Ok(true)
    }

    /// Downloads and unpacks one artifact. The returned string is the deploy
    /// root the app was materialised into.
    async fn deploy_item(&self, item: &DeployQueueItem) -> Result<String, String> {
        let record = self
            .store
            .get_record(&item.pin_id)?
            .ok_or_else(|| format!("no indexed record for {}", item.pin_id))?;

        let deploy_root = self.config.expected_deploy_path().join(&record.first_pin_id);
        // A redeploy wipes the slot.
        clear_directory(&deploy_root)?;
        fs::create_dir_all(&deploy_root)
            .map_err(|e| format!("unable to create deploy directory: {}", e))?;

        let artifact = normalized_artifact(item)
            .ok_or_else(|| "no code or content reference to deploy".to_string())?;
        let bare_pin_id = validate_artifact_reference(&artifact)?;

        let metadata = self.content_store.file_metadata(&bare_pin_id).await?;
        let file_name = choose_file_name(&metadata, &bare_pin_id);
        let destination = deploy_root.join(&file_name);
        let written = self
            .content_store
            .download_content(&bare_pin_id, &destination)
            .await?;
        try_log!(
            self.ctx, debug,
            "Downloaded {} ({} bytes, expected {})",
            destination.display(),
            written,
            metadata.file_size
        );

        if file_name.to_lowercase().ends_with(".zip") {
            unzip_into(&destination, &deploy_root)?;
            let _ = fs::remove_file(&destination);
        }

        Ok(deploy_root.display().to_string())
    }

    /// Bumps `try_count`; at the retry budget the item leaves the queue and
    /// a terminal `failed` result keeps the last error.
    pub fn record_failure(&self, item: &DeployQueueItem, message: &str) -> Result<(), String> {
        let mut item = item.clone();
        item.try_count += 1;
        if item.try_count >= self.config.deploy.retry_budget {
            try_log!(
                self.ctx, warn,
                "Pin {} exceeded deploy retry budget ({}), parking as failed",
                item.pin_id,
                self.config.deploy.retry_budget
            );
            let deploy_root = self
                .config
                .expected_deploy_path()
                .join(&item.first_pin_id)
                .display()
                .to_string();
            self.store.remove_from_queue(&item.pin_id)?;
            self.write_result(&item, DeployStatus::Failed, &deploy_root, message)?;
        } else {
            self.store.update_queue_item(&item)?;
        }
        Ok(())
    }

    fn write_result(
        &self,
        item: &DeployQueueItem,
        status: DeployStatus,
        deploy_file_path: &str,
        message: &str,
    ) -> Result<(), String> {
        let now = now_ms();
        let created_at = match self.store.get_deploy_result(&item.pin_id)? {
            Some(existing) => existing.created_at,
            None => now,
        };
        self.store.put_deploy_result(&DeployResult {
            first_pin_id: item.first_pin_id.clone(),
            pin_id: item.pin_id.clone(),
            content: item.content.clone(),
            code: item.code.clone(),
            content_type: item.content_type.clone(),
            version: item.version.clone(),
            deploy_status: status,
            deploy_file_path: deploy_file_path.to_string(),
            deploy_message: message.to_string(),
            created_at,
            updated_at: now,
        })
    }
}

/// External redeploy entry point. Refuses when the pin is already queued;
/// the original block timestamp is preserved so FIFO order stays stable.
pub fn request_redeploy(store: &Store, pin_id: &str) -> Result<(), String> {
    if store.get_queue_item(pin_id)?.is_some() {
        return Err(format!("deploy already queued for {}", pin_id));
    }
    let record = store
        .get_record(pin_id)?
        .ok_or_else(|| format!("no indexed record for {}", pin_id))?;
    let artifact = deploy_artifact_reference(&record)
        .ok_or_else(|| format!("no code or content reference for {}", pin_id))?;
    store.enqueue_deploy(&DeployQueueItem {
        first_pin_id: record.first_pin_id.clone(),
        pin_id: record.pin_id.clone(),
        timestamp: record.timestamp,
        content: record.content.clone(),
        code: artifact,
        content_type: record.content_type.clone(),
        version: record.version.clone(),
        try_count: 0,
        created_at: now_ms(),
    })?;
    Ok(())
}

fn normalized_artifact(item: &DeployQueueItem) -> Option<String> {
    if !item.code.is_empty() {
        return Some(item.code.clone());
    }
    if !item.content.is_empty() {
        if item.content.starts_with("metafile://") {
            return Some(item.content.clone());
        }
        return Some(format!("metafile://{}", item.content));
    }
    None
}

/// Checks the `metafile://{64 hex}i{vout}` shape and returns the bare pin.
pub fn validate_artifact_reference(artifact: &str) -> Result<String, String> {
    if !METAFILE_REF_REGEX.is_match(artifact) {
        return Err(format!(
            "invalid pin reference: {}, expected format: metafile://<pinid>",
            artifact
        ));
    }
    Ok(artifact.trim_start_matches("metafile://").to_string())
}

/// HTML entry points land as `index.html` so the deploy root can be served
/// directly; everything else keeps the server's name or falls back to
/// `{pin}{ext}`.
pub fn choose_file_name(metadata: &FileMetadata, bare_pin_id: &str) -> String {
    let mut extension = metadata.file_extension.clone();
    if extension.is_empty() {
        extension = extension_from_content_type(&metadata.content_type).to_string();
    }
    if extension.is_empty() {
        extension = ".bin".to_string();
    }

    let lowered = extension.to_lowercase();
    if lowered == ".html" || lowered == ".htm" || metadata.content_type.to_lowercase().contains("html")
    {
        return "index.html".to_string();
    }
    if !metadata.file_name.is_empty() {
        return metadata.file_name.clone();
    }
    format!("{}{}", bare_pin_id, extension)
}

fn extension_from_content_type(content_type: &str) -> &'static str {
    let content_type = content_type.to_lowercase();
    if content_type.contains("zip") {
        return ".zip";
    }
    if content_type.contains("javascript") || content_type.contains("ecmascript") {
        return ".js";
    }
    if content_type.contains("html") {
        return ".html";
    }
    if content_type.contains("css") {
        return ".css";
    }
    if content_type.contains("json") {
        return ".json";
    }
    ""
}

/// Removes the contents of `dir`, keeping the directory itself.
fn clear_directory(dir: &Path) -> Result<(), String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Ok(());
    };
    for entry in entries {
        let entry = entry.map_err(|e| format!("unable to read deploy directory: {}", e))?;
        let path = entry.path();
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        removed.map_err(|e| format!("unable to remove {}: {}", path.display(), e))?;
    }
    Ok(())
}

/// Extracts an archive into `target_dir`, preserving directory structure.
/// Every entry name is vetted before anything is written so an archive
/// containing an escaping path leaves no files behind.
pub fn unzip_into(zip_path: &Path, target_dir: &Path) -> Result<(), String> {
    let file =
        File::open(zip_path).map_err(|e| format!("unable to open {}: {}", zip_path.display(), e))?;
    let mut archive =
        ZipArchive::new(file).map_err(|e| format!("unable to read zip archive: {}", e))?;

    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| format!("unable to read zip entry: {}", e))?;
        if entry.enclosed_name().is_none() {
            return Err(format!("invalid file path in archive: {}", entry.name()));
        }
    }

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| format!("unable to read zip entry: {}", e))?;
        let relative: PathBuf = match entry.enclosed_name() {
            Some(path) => path.to_path_buf(),
            None => continue,
        };
        let destination = target_dir.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&destination)
                .map_err(|e| format!("unable to create {}: {}", destination.display(), e))?;
            continue;
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("unable to create {}: {}", parent.display(), e))?;
        }
        let mut output = File::create(&destination)
            .map_err(|e| format!("unable to create {}: {}", destination.display(), e))?;
        std::io::copy(&mut entry, &mut output)
            .map_err(|e| format!("unable to extract {}: {}", destination.display(), e))?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::fs::{self, File};
    use std::io::Write;
    use std::sync::Arc;

    use tempfile::TempDir;
    use test_case::test_case;
    use zip::write::FileOptions;
    use zip::ZipWriter;

    use super::content_store::FileMetadata;
    use super::{
        choose_file_name, request_redeploy, unzip_into, validate_artifact_reference, DeployWorker,
    };
    use crate::config::Config;
    use crate::db::models::{DeployQueueItem, DeployStatus};
    use crate::db::test::{open_test_store, record};
    use crate::db::Store;
    use crate::utils::Context;

    fn test_worker() -> (TempDir, Arc<Store>, DeployWorker) {
        let (dir, store) = open_test_store();
        let store = Arc::new(store);
        let mut config = Config::devnet_default();
        config.deploy.base_dir = dir.path().join("deploy").display().to_string();
        let worker = DeployWorker::new(store.clone(), &config, &Context::empty());
        (dir, store, worker)
    }

    fn queue_item(pin_id: &str, code: &str) -> DeployQueueItem {
        DeployQueueItem {
            first_pin_id: pin_id.to_string(),
            pin_id: pin_id.to_string(),
            timestamp: 1_700_000_000_000,
            content: String::new(),
            code: code.to_string(),
            content_type: "application/zip".to_string(),
            version: "v1".to_string(),
            try_count: 0,
            created_at: 1_700_000_000_000,
        }
    }

    fn metadata(content_type: &str, extension: &str, name: &str) -> FileMetadata {
        FileMetadata {
            pin_id: String::new(),
            content_type: content_type.to_string(),
            file_extension: extension.to_string(),
            file_name: name.to_string(),
            file_size: 0,
        }
    }

    #[test]
    fn artifact_references_are_validated() {
        let valid = format!("metafile://{}i0", "a".repeat(64));
        assert_eq!(
            validate_artifact_reference(&valid).unwrap(),
            format!("{}i0", "a".repeat(64))
        );
        assert!(validate_artifact_reference("metafile://short").is_err());
        assert!(validate_artifact_reference(&format!("{}i0", "a".repeat(64))).is_err());
        assert!(validate_artifact_reference(&format!("metafile://{}I0", "A".repeat(64))).is_err());
    }

    #[test]
    fn html_artifacts_become_the_index_file() {
        assert_eq!(
            choose_file_name(&metadata("text/html", "", ""), "pin"),
            "index.html"
        );
        assert_eq!(
            choose_file_name(&metadata("application/zip", ".html", "app.html"), "pin"),
            "index.html"
        );
    }

    #[test]
    fn server_file_name_wins_for_other_content() {
        assert_eq!(
            choose_file_name(&metadata("application/zip", ".zip", "bundle.zip"), "pin"),
            "bundle.zip"
        );
    }

    #[test]
    fn missing_metadata_falls_back_to_pin_and_extension() {
        assert_eq!(
            choose_file_name(&metadata("application/zip", "", ""), "pin"),
            "pin.zip"
        );
        assert_eq!(
            choose_file_name(&metadata("application/octet-stream", "", ""), "pin"),
            "pin.bin"
        );
    }

    #[test_case("application/zip" => ".zip"; "zip")]
    #[test_case("text/javascript" => ".js"; "javascript")]
    #[test_case("text/html; charset=utf-8" => ".html"; "html with charset")]
    #[test_case("text/css" => ".css"; "css")]
    #[test_case("application/json" => ".json"; "json")]
    #[test_case("application/octet-stream" => ""; "unknown")]
    fn content_type_extension_mapping(content_type: &str) -> &'static str {
        super::extension_from_content_type(content_type)
    }

    #[test]
    fn zip_extraction_preserves_directories() {
        let dir = TempDir::new().unwrap();
        let zip_path = dir.path().join("bundle.zip");
        let mut writer = ZipWriter::new(File::create(&zip_path).unwrap());
        writer
            .start_file("index.html", FileOptions::default())
            .unwrap();
        writer.write_all(b"<html></html>").unwrap();
        writer
            .start_file("assets/app.js", FileOptions::default())
            .unwrap();
        writer.write_all(b"console.log(1)").unwrap();
        writer.finish().unwrap();

        let target = dir.path().join("out");
        fs::create_dir_all(&target).unwrap();
        unzip_into(&zip_path, &target).unwrap();
        assert!(target.join("index.html").exists());
        assert!(target.join("assets/app.js").exists());
    }

    #[test]
    fn escaping_zip_entries_are_refused_before_any_write() {
        let dir = TempDir::new().unwrap();
        let zip_path = dir.path().join("evil.zip");
        let mut writer = ZipWriter::new(File::create(&zip_path).unwrap());
        writer
            .start_file("safe.txt", FileOptions::default())
            .unwrap();
        writer.write_all(b"ok").unwrap();
        writer
            .start_file("../evil", FileOptions::default())
            .unwrap();
        writer.write_all(b"nope").unwrap();
        writer.finish().unwrap();

        let target = dir.path().join("out");
        fs::create_dir_all(&target).unwrap();
        assert!(unzip_into(&zip_path, &target).is_err());
        assert!(!target.join("safe.txt").exists());
        assert!(!dir.path().join("evil").exists());
    }

    #[test]
    fn retry_budget_parks_the_item_as_failed() {
        let (_dir, store, worker) = test_worker();
        let pin = format!("{}i0", "b".repeat(64));
        let item = queue_item(&pin, &format!("metafile://{}", pin));
        assert!(store.enqueue_deploy(&item).unwrap());

        worker.record_failure(&item, "content store code 1").unwrap();
        let queued = store.get_queue_item(&pin).unwrap().unwrap();
        assert_eq!(queued.try_count, 1);
        worker.record_failure(&queued, "content store code 1").unwrap();

        let queued = store.get_queue_item(&pin).unwrap().unwrap();
        assert_eq!(queued.try_count, 2);
        worker.record_failure(&queued, "content store code 1").unwrap();

        assert!(store.get_queue_item(&pin).unwrap().is_none());
        let result = store.get_deploy_result(&pin).unwrap().unwrap();
        assert_eq!(result.deploy_status, DeployStatus::Failed);
        assert_eq!(result.deploy_message, "content store code 1");
    }

    #[test]
    fn invalid_artifact_reference_fails_without_touching_the_network() {
        let (_dir, store, worker) = test_worker();
        let pin = format!("{}i0", "c".repeat(64));
        let mut seeded = record(&pin, &pin, 1_700_000_000_000);
        seeded.code = "metafile://not-a-pin".to_string();
        store.insert_record(&seeded).unwrap();
        let item = queue_item(&pin, "metafile://not-a-pin");

        let err = hiro_system_kit::nestable_block_on(worker.deploy_item(&item)).unwrap_err();
        assert!(err.contains("invalid pin reference"));
    }

    #[test]
    fn redeploy_refuses_a_queued_pin_and_preserves_fifo_order() {
        let (_dir, store, _worker) = test_worker();
        let pin = format!("{}i0", "d".repeat(64));
        let mut seeded = record(&pin, &pin, 1_700_000_000_000);
        seeded.code = format!("metafile://{}", pin);
        store.insert_record(&seeded).unwrap();

        request_redeploy(&store, &pin).unwrap();
        let queued = store.get_queue_item(&pin).unwrap().unwrap();
        assert_eq!(queued.timestamp, 1_700_000_000_000);
        assert_eq!(queued.try_count, 0);

        let err = request_redeploy(&store, &pin).unwrap_err();
        assert!(err.contains("already queued"));
    }

    #[test]
    fn redeploy_requires_an_indexed_record() {
        let (_dir, store, _worker) = test_worker();
        assert!(request_redeploy(&store, "missing").is_err());
    }
}
