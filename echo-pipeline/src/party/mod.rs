//! One party's feeds and the pipeline that turns them into state.

pub mod feed_provider;
pub mod messages;
pub mod pipeline;

pub use feed_provider::{PartyFeedProvider, ProviderError};
pub use messages::{
    dependency_selector, EchoEnvelope, FeedMessage, ItemGenesis, MessageCodecError, Payload,
};
pub use pipeline::{PartyPipeline, PipelineConfig, PipelineError};
