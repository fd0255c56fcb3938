pub mod codec;
pub mod txid;

use std::fmt;
use std::str::FromStr;

use bitcoin::{Address, Network, Script};

/// The two supported chain variants. Wire serialization is identical; `mvc`
/// transactions with a version field >= 10 hash through the compact
/// pre-image in [txid].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    Btc,
    Mvc,
}

impl ChainKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainKind::Btc => "btc",
            ChainKind::Mvc => "mvc",
        }
    }
}

impl fmt::Display for ChainKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "btc" => Ok(ChainKind::Btc),
            "mvc" => Ok(ChainKind::Mvc),
            _ => Err(format!("unsupported chain '{}'", value)),
        }
    }
}

/// Derives the spendable address encoded by an output locking script. Both
/// chains use the bitcoin mainnet version bytes for their base58 forms.
pub fn address_from_output_script(script: &Script) -> Result<String, String> {
    if script.is_empty() {
        return Err("empty script pubkey".to_string());
    }
    Address::from_script(script, Network::Bitcoin)
        .map(|address| address.to_string())
        .map_err(|e| format!("unable to derive address from script: {}", e))
}
