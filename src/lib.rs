pub mod config;
pub mod constants;
pub mod core;
pub mod native;
pub mod pipeline;
pub mod provider;
pub mod remote;
pub mod stubs;
