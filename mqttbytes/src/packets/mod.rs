mod connack;
mod connect;
mod publish;
mod suback;
mod subscribe;
mod unsuback;
mod unsubscribe;

pub use connack::{ConnAck, ConnectReturnCode};
pub use connect::{Connect, LastWill};
pub use publish::Publish;
pub use suback::{SubAck, SubscribeReturnCodes};
pub use subscribe::{Subscribe, SubscribeTopic};
pub use unsuback::UnsubAck;
pub use unsubscribe::Unsubscribe;
