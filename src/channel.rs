pub mod destination;
pub mod lifecycle;
pub mod response;
pub mod source;

pub use lifecycle::{
    Channel, ChannelBindings, ChannelState, DestinationBinding, LifecycleError,
    DEFAULT_QUEUE_POLL_INTERVAL,
};
pub use response::compose;
