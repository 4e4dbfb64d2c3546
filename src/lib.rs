pub mod config;
pub mod error;
pub mod http;
pub mod limits;
pub mod metrics;
pub mod proxy;
pub mod server;
pub mod timeout;
pub mod upstream;
