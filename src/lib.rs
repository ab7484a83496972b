pub mod config;
pub mod core;
pub mod session;

pub use config::Settings;
pub use session::Session;
