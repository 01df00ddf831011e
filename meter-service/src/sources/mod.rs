pub mod broker_http;
pub mod replay_file;

pub use broker_http::BrokerHttpSource;
pub use replay_file::BrokerReplayFileSource;
