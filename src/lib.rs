pub mod config;
pub mod error;
pub mod logging;
pub mod common;
pub mod tls;
pub mod target;
pub mod cors;
pub mod forward;
pub mod server;
pub mod patterns;
pub mod bypass;
pub mod rewrite;
pub mod settings;
pub mod intercept;
pub mod transport;

pub use bypass::BypassMatcher;
pub use config::Config;
pub use error::ProxyError;
pub use intercept::Interceptors;
pub use rewrite::rewrite_url;
pub use server::ProxyServer;
pub use settings::{ProxySettings, SettingsStore};
