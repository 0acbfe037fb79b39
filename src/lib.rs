pub mod cli;
pub mod cluster;
pub mod commands;
pub mod config;
pub mod error;
pub mod models;
pub mod server;
pub mod services;
pub mod worker;
