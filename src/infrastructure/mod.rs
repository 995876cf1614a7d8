// Infrastructure layer - External dependencies and adapters
pub mod config;
pub mod connection_pool;
pub mod influx_store;
pub mod json_mapper;
pub mod memory_store;
pub mod overflow_log;
