#![warn(rust_2018_idioms)]
#![warn(clippy::dbg_macro, clippy::print_stdout)]
#![doc = include_str!("../README.md")]

mod byte_queue;
pub mod config;
pub mod conn;
mod error;
pub mod input;
pub mod output;
pub mod params;
pub mod record;
pub mod server;
pub mod status;

pub use crate::{
    config::ServerConfig,
    conn::ConnectionWorker,
    error::{FcgiError, FcgiResult},
    input::InputSide,
    output::OutputSide,
    server::Server,
    status::{DefaultStatusText, StatusText},
};
