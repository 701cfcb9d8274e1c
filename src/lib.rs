pub mod api;
pub mod chat;
pub mod config;
pub mod daemon;
pub mod error;
pub mod humanize;
pub mod mirror;
pub mod observability;
pub mod orchestrator;
pub mod registry;
pub mod remote;
pub mod reporter;
pub mod retry;
pub mod upload;
