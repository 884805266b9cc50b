pub mod auth;
pub mod config;
pub mod console;
pub mod instance;
pub mod ipc;
pub mod process_monitor;
pub mod supervisor;
pub mod utils;
