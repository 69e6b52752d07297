pub mod agent;
pub mod artifacts;
pub mod backend;
pub mod blob;
pub mod config;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod preview;
pub mod session;
pub mod store;
