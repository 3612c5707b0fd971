pub mod client;
pub mod config;
pub mod console;
pub mod error;
pub mod event;
pub mod output;
pub mod paths;
pub mod poller;
pub mod ports;
pub mod position;
pub mod process_scan;
pub mod session;
pub mod status;
pub mod supervisor;

#[cfg(test)]
mod testing;
