// Application layer - ingestion, buffering, querying and retention use cases
pub mod errors;
pub mod flush_batch;
pub mod ingestion_gateway;
pub mod last_known_cache;
pub mod query_engine;
pub mod retention_service;
pub mod sample_buffer;
pub mod sample_store;
