pub mod auth;
pub mod console;
pub mod instance;
pub mod server;
