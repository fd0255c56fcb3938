#[macro_use]
extern crate slog;

#[macro_use]
extern crate serde_derive;

pub mod cli;
pub mod config;

fn main() {
    cli::main();
}
