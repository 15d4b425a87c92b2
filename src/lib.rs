pub mod backend;
pub mod config;
pub mod dashboard;
pub mod engine;
pub mod error;
pub mod events;
pub mod node;
pub mod scheduler;
pub mod shutdown;
pub mod ssh;
