// HTTP clients for the external collaborators.

pub mod generation_client;
pub mod publish_gateway;
pub mod reply_gateway;

pub use generation_client::GenerationClient;
pub use publish_gateway::HttpPublishGateway;
pub use reply_gateway::HttpReplyGateway;
