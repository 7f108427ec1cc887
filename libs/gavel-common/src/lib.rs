pub mod client;
pub mod languages;
pub mod logging;
pub mod rpc;
pub mod types;
