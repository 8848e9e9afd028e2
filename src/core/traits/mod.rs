pub mod backend;
pub mod engine;
