use crate::chain::ChainKind;
use std::path::PathBuf;

pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_DEPLOY_TICK_SECS: u64 = 5;
pub const DEFAULT_DEPLOY_RETRY_BUDGET: u32 = 3;
pub const DEFAULT_RPC_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_ULIMIT: usize = 2048;
pub const DEFAULT_MAX_ANCESTOR_DEPTH: usize = 64;

#[derive(Clone, Debug)]
pub struct Config {
    pub storage: StorageConfig,
    pub network: NetworkConfig,
    pub indexer: IndexerConfig,
    pub deploy: DeployConfig,
    pub content_store: ContentStoreConfig,
    pub resources: ResourcesConfig,
    pub logs: LogConfig,
}

#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub working_dir: String,
}

#[derive(Clone, Debug)]
pub struct NetworkConfig {
    pub chain: ChainKind,
    pub rpc_url: String,
    pub rpc_username: String,
    pub rpc_password: String,
    /// When set, the mempool subscriber is started once the scanner reaches
    /// the chain tip.
    pub zmq_url: Option<String>,
}

#[derive(Clone, Debug)]
pub struct IndexerConfig {
    /// Overrides the per-chain floor when set.
    pub start_height: Option<u64>,
    pub btc_init_block_height: u64,
    pub mvc_init_block_height: u64,
    pub scan_interval_secs: u64,
    pub max_ancestor_depth: usize,
}

#[derive(Clone, Debug)]
pub struct DeployConfig {
    pub base_dir: String,
    pub tick_secs: u64,
    pub retry_budget: u32,
}

#[derive(Clone, Debug)]
pub struct ContentStoreConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ResourcesConfig {
    pub ulimit: usize,
    pub cpu_core_available: usize,
    pub rpc_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LogConfig {
    pub indexer_internals: bool,
}

impl Config {
    pub fn expected_data_dir(&self) -> PathBuf {
        let mut destination_path = PathBuf::new();
        destination_path.push(&self.storage.working_dir);
        destination_path
    }

    pub fn expected_deploy_path(&self) -> PathBuf {
        let mut destination_path = PathBuf::new();
        destination_path.push(&self.deploy.base_dir);
        destination_path
    }

    /// Floor height for the configured chain; the scanner resumes from
    /// `max(floor, persisted cursor + 1)`.
    pub fn init_block_height(&self) -> u64 {
        if let Some(height) = self.indexer.start_height {
            return height;
        }
        match self.network.chain {
            ChainKind::Btc => self.indexer.btc_init_block_height,
            ChainKind::Mvc => self.indexer.mvc_init_block_height,
        }
    }

    pub fn is_mempool_subscription_enabled(&self) -> bool {
        self.network.zmq_url.is_some()
    }

    pub fn devnet_default() -> Config {
        Config {
            storage: StorageConfig {
                working_dir: default_cache_path(),
            },
            network: NetworkConfig {
                chain: ChainKind::Mvc,
                rpc_url: "http://0.0.0.0:9882".into(),
                rpc_username: "devnet".into(),
                rpc_password: "devnet".into(),
                zmq_url: Some("tcp://0.0.0.0:28332".into()),
            },
            indexer: IndexerConfig {
                start_height: None,
                btc_init_block_height: 0,
                mvc_init_block_height: 0,
                scan_interval_secs: DEFAULT_SCAN_INTERVAL_SECS,
                max_ancestor_depth: DEFAULT_MAX_ANCESTOR_DEPTH,
            },
            deploy: DeployConfig {
                base_dir: default_deploy_path(),
                tick_secs: DEFAULT_DEPLOY_TICK_SECS,
                retry_budget: DEFAULT_DEPLOY_RETRY_BUDGET,
            },
            content_store: ContentStoreConfig {
                base_url: "http://0.0.0.0:8045".into(),
                timeout_secs: DEFAULT_RPC_TIMEOUT_SECS,
            },
            resources: ResourcesConfig {
                ulimit: DEFAULT_ULIMIT,
                cpu_core_available: num_cpus::get(),
                rpc_timeout_secs: DEFAULT_RPC_TIMEOUT_SECS,
            },
            logs: LogConfig {
                indexer_internals: true,
            },
        }
    }

    pub fn mainnet_default() -> Config {
        Config {
            storage: StorageConfig {
                working_dir: default_cache_path(),
            },
            network: NetworkConfig {
                chain: ChainKind::Mvc,
                rpc_url: "http://0.0.0.0:9882".into(),
                rpc_username: "devnet".into(),
                rpc_password: "devnet".into(),
                zmq_url: None,
            },
            indexer: IndexerConfig {
                start_height: None,
                btc_init_block_height: 0,
                mvc_init_block_height: 0,
                scan_interval_secs: DEFAULT_SCAN_INTERVAL_SECS,
                max_ancestor_depth: DEFAULT_MAX_ANCESTOR_DEPTH,
            },
            deploy: DeployConfig {
                base_dir: default_deploy_path(),
                tick_secs: DEFAULT_DEPLOY_TICK_SECS,
                retry_budget: DEFAULT_DEPLOY_RETRY_BUDGET,
            },
            content_store: ContentStoreConfig {
                base_url: "https://file.metaid.io".into(),
                timeout_secs: DEFAULT_RPC_TIMEOUT_SECS,
            },
            resources: ResourcesConfig {
                ulimit: DEFAULT_ULIMIT,
                cpu_core_available: num_cpus::get(),
                rpc_timeout_secs: DEFAULT_RPC_TIMEOUT_SECS,
            },
            logs: LogConfig {
                indexer_internals: true,
            },
        }
    }
}

pub fn default_cache_path() -> String {
    let mut cache_path = std::env::current_dir().expect("unable to get current dir");
    cache_path.push("metaapp");
    format!("{}", cache_path.display())
}

pub fn default_deploy_path() -> String {
    let mut deploy_path = std::env::current_dir().expect("unable to get current dir");
    deploy_path.push("deploy_data");
    format!("{}", deploy_path.display())
}
