pub mod api;
pub mod compression;
pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod registry;
pub mod selector;
