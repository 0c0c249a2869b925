mod buffer;
mod consumer;
mod publisher;
mod streamer;

pub use buffer::{BufferedEntry, Cleared, MessageBuffer};
pub use consumer::{BackgroundConsumer, ConnectorState, ConnectorStatus};
pub use publisher::PublisherService;
pub use streamer::StreamService;
