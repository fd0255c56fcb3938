#[macro_use]
extern crate slog;

#[macro_use]
extern crate serde_derive;

#[macro_use]
extern crate lazy_static;

extern crate serde;

pub extern crate bitcoin;
pub extern crate hex;

pub mod chain;
pub mod config;
pub mod db;
pub mod deploy;
pub mod index;
pub mod node;
pub mod observer;
pub mod protocol;
pub mod scan;
pub mod service;
pub mod utils;

use config::Config;
use db::Store;
use utils::Context;

/// Opens every collection of the indexer store, retrying for a while when
/// another process holds a lock. A store that still cannot open is fatal and
/// surfaces as `Err`.
pub fn initialize_store(config: &Config, ctx: &Context) -> Result<Store, String> {
    Store::open(&config.expected_data_dir(), config.resources.ulimit, ctx)
}
