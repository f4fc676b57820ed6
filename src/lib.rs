pub mod api;
pub mod app;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod db;
pub mod global;
pub mod integrations;
pub mod mention;
pub mod refresh;
pub mod suggestions;
pub mod workflow;
