pub mod catalogue;
pub mod config;
pub mod credentials;
pub mod domain;
pub mod error;
pub mod manifest;
pub mod output;
pub mod paths;
pub mod pipeline;
pub mod storage;
pub mod tui;
pub mod walk;
