pub mod analytics;
pub mod config;
pub mod pipeline;
pub mod record;
pub mod sink;
pub mod store;
