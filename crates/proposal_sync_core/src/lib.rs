pub mod config;
pub mod dataset;
pub mod github;
pub mod markdown;
pub mod resolve;
pub mod sync;
