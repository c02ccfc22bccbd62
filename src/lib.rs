pub mod app;
pub mod atlas;
pub mod cache;
pub mod config;
pub mod domain;
pub mod download;
pub mod error;
pub mod formats;
pub mod output;
pub mod providers;
pub mod registration;
pub mod registry;
pub mod worker;
