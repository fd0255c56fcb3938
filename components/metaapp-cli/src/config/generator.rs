use metaapp::chain::ChainKind;

pub fn generate_config(chain: &ChainKind) -> String {
    let conf = format!(
        r#"[storage]
working_dir = "metaapp"

[network]
chain = "{chain}"
rpc_url = "http://localhost:9882"
rpc_username = "devnet"
rpc_password = "devnet"
# Enables the mempool subscriber once the scanner reaches the chain tip.
# zmq_url = "tcp://localhost:28332"

[indexer]
# start_height = 0
btc_init_block_height = 0
mvc_init_block_height = 0
scan_interval_secs = 10
max_ancestor_depth = 64

[deploy]
base_dir = "deploy_data"
tick_secs = 5
retry_budget = 3

[content_store]
base_url = "https://file.metaid.io"
timeout_secs = 15

[resources]
ulimit = 2048
cpu_core_available = 4
rpc_timeout_secs = 15

[logs]
indexer_internals = true
"#,
        chain = chain.as_str(),
    );
    conf
}

#[cfg(test)]
mod test {
    use metaapp::chain::ChainKind;

    use super::generate_config;
    use crate::config::ConfigFile;

    #[test]
    fn generated_config_parses_back() {
        for chain in [ChainKind::Btc, ChainKind::Mvc] {
            let raw = generate_config(&chain);
            let config_file: ConfigFile = toml::from_str(&raw).unwrap();
            let config = ConfigFile::from_config_file(config_file).unwrap();
            assert_eq!(config.network.chain, chain);
        }
    }
}
