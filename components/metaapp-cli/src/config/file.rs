use std::fs::File;
use std::io::{BufReader, Read};
use std::str::FromStr;

use metaapp::chain::ChainKind;
use metaapp::config::{
    default_cache_path, default_deploy_path, Config, ContentStoreConfig, DeployConfig,
    IndexerConfig, LogConfig, NetworkConfig, ResourcesConfig, StorageConfig,
    DEFAULT_DEPLOY_RETRY_BUDGET, DEFAULT_DEPLOY_TICK_SECS, DEFAULT_MAX_ANCESTOR_DEPTH,
    DEFAULT_RPC_TIMEOUT_SECS, DEFAULT_SCAN_INTERVAL_SECS, DEFAULT_ULIMIT,
};

#[derive(Deserialize, Debug, Clone)]
pub struct ConfigFile {
    pub storage: Option<StorageConfigFile>,
    pub network: NetworkConfigFile,
    pub indexer: Option<IndexerConfigFile>,
    pub deploy: Option<DeployConfigFile>,
    pub content_store: Option<ContentStoreConfigFile>,
    pub resources: Option<ResourcesConfigFile>,
    pub logs: Option<LogConfigFile>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct StorageConfigFile {
    pub working_dir: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct NetworkConfigFile {
    pub chain: String,
    pub rpc_url: String,
    pub rpc_username: String,
    pub rpc_password: String,
    pub zmq_url: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct IndexerConfigFile {
    pub start_height: Option<u64>,
    pub btc_init_block_height: Option<u64>,
    pub mvc_init_block_height: Option<u64>,
    pub scan_interval_secs: Option<u64>,
    pub max_ancestor_depth: Option<usize>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct DeployConfigFile {
    pub base_dir: Option<String>,
    pub tick_secs: Option<u64>,
    pub retry_budget: Option<u32>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ContentStoreConfigFile {
    pub base_url: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ResourcesConfigFile {
    pub ulimit: Option<usize>,
    pub cpu_core_available: Option<usize>,
    pub rpc_timeout_secs: Option<u64>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct LogConfigFile {
    pub indexer_internals: Option<bool>,
}

impl ConfigFile {
    pub fn default(
        devnet: bool,
        mainnet: bool,
        config_path: &Option<String>,
    ) -> Result<Config, String> {
        let config = match (devnet, mainnet, config_path) {
            (true, false, _) => Config::devnet_default(),
            (false, true, _) => Config::mainnet_default(),
            (false, false, Some(config_path)) => {
                let file = ConfigFile::from_path(config_path)?;
                ConfigFile::from_config_file(file)?
            }
            _ => Err("unable to determine network with settings provided".to_string())?,
        };
        Ok(config)
    }

    pub fn from_path(path: &str) -> Result<ConfigFile, String> {
        let file = File::open(path).map_err(|e| format!("unable to read file {}: {}", path, e))?;
        let mut file_reader = BufReader::new(file);
        let mut file_buffer = String::new();
        file_reader
            .read_to_string(&mut file_buffer)
            .map_err(|e| format!("unable to read file {}: {}", path, e))?;
        toml::from_str(&file_buffer).map_err(|e| format!("config file malformed: {}", e))
    }

    pub fn from_config_file(config_file: ConfigFile) -> Result<Config, String> {
        let chain = ChainKind::from_str(&config_file.network.chain)?;
        let storage = config_file.storage.unwrap_or(StorageConfigFile {
            working_dir: None,
        });
        let indexer = config_file.indexer.unwrap_or(IndexerConfigFile {
            start_height: None,
            btc_init_block_height: None,
            mvc_init_block_height: None,
            scan_interval_secs: None,
            max_ancestor_depth: None,
        });
        let deploy = config_file.deploy.unwrap_or(DeployConfigFile {
            base_dir: None,
            tick_secs: None,
            retry_budget: None,
        });
        let content_store = config_file.content_store.unwrap_or(ContentStoreConfigFile {
            base_url: None,
            timeout_secs: None,
        });
        let resources = config_file.resources.unwrap_or(ResourcesConfigFile {
            ulimit: None,
            cpu_core_available: None,
            rpc_timeout_secs: None,
        });
        let logs = config_file.logs.unwrap_or(LogConfigFile {
            indexer_internals: None,
        });

        let content_store_base_url = content_store
            .base_url
            .ok_or("config file missing content_store.base_url")?;

        Ok(Config {
            storage: StorageConfig {
                working_dir: storage.working_dir.unwrap_or_else(default_cache_path),
            },
            network: NetworkConfig {
                chain,
                rpc_url: config_file.network.rpc_url,
                rpc_username: config_file.network.rpc_username,
                rpc_password: config_file.network.rpc_password,
                zmq_url: config_file.network.zmq_url,
            },
            indexer: IndexerConfig {
                start_height: indexer.start_height,
                btc_init_block_height: indexer.btc_init_block_height.unwrap_or(0),
                mvc_init_block_height: indexer.mvc_init_block_height.unwrap_or(0),
                scan_interval_secs: indexer
                    .scan_interval_secs
                    .unwrap_or(DEFAULT_SCAN_INTERVAL_SECS),
                max_ancestor_depth: indexer
                    .max_ancestor_depth
                    .unwrap_or(DEFAULT_MAX_ANCESTOR_DEPTH),
            },
            deploy: DeployConfig {
                base_dir: deploy.base_dir.unwrap_or_else(default_deploy_path),
                tick_secs: deploy.tick_secs.unwrap_or(DEFAULT_DEPLOY_TICK_SECS),
                retry_budget: deploy.retry_budget.unwrap_or(DEFAULT_DEPLOY_RETRY_BUDGET),
            },
            content_store: ContentStoreConfig {
                base_url: content_store_base_url,
                timeout_secs: content_store
                    .timeout_secs
                    .unwrap_or(DEFAULT_RPC_TIMEOUT_SECS),
            },
            resources: ResourcesConfig {
                ulimit: resources.ulimit.unwrap_or(DEFAULT_ULIMIT),
                cpu_core_available: resources.cpu_core_available.unwrap_or_else(num_cpus::get),
                rpc_timeout_secs: resources
                    .rpc_timeout_secs
                    .unwrap_or(DEFAULT_RPC_TIMEOUT_SECS),
            },
            logs: LogConfig {
                indexer_internals: logs.indexer_internals.unwrap_or(true),
            },
        })
    }
}
