mod chat;
mod codec;
mod dispatch;

pub use chat::{ChatMessage, PingMessage, PongMessage};
pub use codec::{CodecError, MessageTypeId, NetworkMessage, encode_envelope, split_envelope};
pub use dispatch::{MessageReceiver, MessageSender};
