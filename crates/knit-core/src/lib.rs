pub mod config;
pub mod hooks;
pub mod types;

pub use config::Config;
pub use hooks::HookConfig;
pub use types::*;
