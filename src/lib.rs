pub mod actions;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gate;
pub mod scheduler;
pub mod submit;
