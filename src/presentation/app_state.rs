// Application state for HTTP handlers
use crate::application::ingestion_gateway::IngestionGateway;
use crate::application::last_known_cache::LastKnownCache;
use crate::application::query_engine::QueryEngine;
use crate::application::sample_buffer::SampleBuffer;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub gateway: IngestionGateway,
    pub query_engine: QueryEngine,
    pub buffer: SampleBuffer,
    pub cache: Arc<LastKnownCache>,
}
