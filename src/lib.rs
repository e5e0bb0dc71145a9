//! taskbot: execution core of a notification bot.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetch;
pub mod notify;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod tasks;
