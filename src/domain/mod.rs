// Domain layer - Samples, streams and query shapes
pub mod query;
pub mod sample;
