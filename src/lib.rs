pub mod archive;
pub mod bootstrap;
pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod logger;
pub mod tls;
pub mod tracker;
pub mod types;
pub mod uploader;
pub mod watcher;
