#[macro_use]
extern crate num_derive;

pub mod cache;
pub mod engine;
pub mod format;
pub mod server;
pub mod stream;
pub mod util;
pub mod worker;

pub const SERVER_NAME: &str = "sluice";
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");
