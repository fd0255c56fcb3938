use crate::chain::ChainKind;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PinOperation {
    Create,
    Modify,
    Revoke,
}

impl PinOperation {
    pub fn from_tag(tag: &str) -> Option<PinOperation> {
        match tag {
            "create" => Some(PinOperation::Create),
            "modify" => Some(PinOperation::Modify),
            "revoke" => Some(PinOperation::Revoke),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PinOperation::Create => "create",
            PinOperation::Modify => "modify",
            PinOperation::Revoke => "revoke",
        }
    }
}

/// One version of a logical app. Created on first ingest, mutated only when
/// a mempool pin is confirmed at a higher block height, never deleted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MetaAppRecord {
    pub first_pin_id: String,
    pub pin_id: String,
    pub tx_id: String,
    pub vout: u32,
    pub path: String,
    pub operation: PinOperation,
    pub parent_path: String,

    pub title: String,
    pub app_name: String,
    pub prompt: String,
    pub icon: String,
    pub cover_img: String,
    pub intro_imgs: Vec<String>,
    pub intro: String,
    pub runtime: String,
    pub index_file: String,
    pub version: String,
    pub content_type: String,
    pub content: String,
    pub code: String,
    pub content_hash: String,
    pub metadata: String,
    pub disabled: bool,

    pub chain_name: ChainKind,
    /// 0 denotes a mempool sighting.
    pub block_height: i64,
    /// Millisecond precision.
    pub timestamp: i64,

    pub creator_meta_id: String,
    pub creator_address: String,
    pub owner_address: String,
    pub owner_meta_id: String,

    pub status: i32,
    pub state: i32,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One outstanding or in-flight deployment. At most one entry per `pin_id`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DeployQueueItem {
    pub first_pin_id: String,
    pub pin_id: String,
    /// Enqueue ordering key: the record's original block timestamp.
    pub timestamp: i64,
    pub content: String,
    pub code: String,
    pub content_type: String,
    pub version: String,
    pub try_count: u32,
    pub created_at: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeployStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Terminal deployment record per pin.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DeployResult {
    pub first_pin_id: String,
    pub pin_id: String,
    pub content: String,
    pub code: String,
    pub content_type: String,
    pub version: String,
    pub deploy_status: DeployStatus,
    pub deploy_file_path: String,
    pub deploy_message: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Per-chain scan cursor. `current_sync_height` is the highest block fully
/// drained into the indexer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SyncCursor {
    pub chain_name: ChainKind,
    pub current_sync_height: i64,
    pub created_at: i64,
    pub updated_at: i64,
}
