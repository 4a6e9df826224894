pub mod relay_queue;
pub mod subscription;

pub use relay_queue::RelayQueueSource;
pub use subscription::SubscriptionSource;
