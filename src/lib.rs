pub mod admission;
pub mod archive;
pub mod cache_key;
pub mod cli;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod job;
pub mod progress;
pub mod serve;
pub mod signing;
pub mod store;
pub mod transfer;
pub mod ui;
pub mod worker;
