pub mod config;
pub mod dependencies;
pub mod environment;
pub mod process_monitor;
pub mod ranking;
pub mod supervisor;
pub mod utils;
