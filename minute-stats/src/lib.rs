pub mod api;
pub mod collector;
pub mod config;
pub mod minute;
pub mod notifier;
pub mod prometheus;
pub mod router;
pub mod server;
pub mod sinks;
pub mod store;
pub mod time;
