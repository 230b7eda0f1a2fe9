//! Switchboard core library: session registry, request dispatch, update and log
//! streams, and the health watchdog, used by the CLI.

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod gateway;
pub mod health;
pub mod init;
pub mod logging;
pub mod session;
pub mod settings;
