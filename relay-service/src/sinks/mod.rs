pub mod monitor;
pub mod publish;

pub use monitor::MonitorSink;
pub use publish::PublishSink;
