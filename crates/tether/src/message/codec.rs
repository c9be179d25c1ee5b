use rkyv::rancor;

/// Stable wire identifier of an application message type.
pub type MessageTypeId = u16;

const TAG_LEN: usize = std::mem::size_of::<MessageTypeId>();

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
    #[error("envelope shorter than its type tag ({0} bytes)")]
    Truncated(usize),
}

/// An application message with a fixed type tag and a byte codec.
///
/// Implement it with [`network_message!`](crate::network_message) for types
/// deriving rkyv's `Archive`, `Serialize` and `Deserialize`.
pub trait NetworkMessage: Sized {
    const TYPE_ID: MessageTypeId;

    fn pack(&self) -> Result<Vec<u8>, CodecError>;

    fn unpack(bytes: &[u8]) -> Result<Self, CodecError>;
}

/// Packs `message` behind its little-endian type tag.
pub fn encode_envelope<M: NetworkMessage>(message: &M) -> Result<Vec<u8>, CodecError> {
    let body = message.pack()?;
    let mut envelope = Vec::with_capacity(TAG_LEN + body.len());
    envelope.extend_from_slice(&M::TYPE_ID.to_le_bytes());
    envelope.extend_from_slice(&body);
    Ok(envelope)
}

pub fn split_envelope(envelope: &[u8]) -> Result<(MessageTypeId, &[u8]), CodecError> {
    if envelope.len() < TAG_LEN {
        return Err(CodecError::Truncated(envelope.len()));
    }
    let (tag, body) = envelope.split_at(TAG_LEN);
    Ok((MessageTypeId::from_le_bytes([tag[0], tag[1]]), body))
}

/// Implements [`NetworkMessage`] for an rkyv-archivable type.
///
/// ```ignore
/// #[derive(Archive, Serialize, Deserialize)]
/// struct Spawn { entity: u32 }
///
/// tether::network_message!(Spawn, 40);
/// ```
#[macro_export]
macro_rules! network_message {
    ($ty:ty, $id:expr) => {
        impl $crate::message::NetworkMessage for $ty {
            const TYPE_ID: $crate::message::MessageTypeId = $id;

            fn pack(&self) -> ::std::result::Result<::std::vec::Vec<u8>, $crate::message::CodecError> {
                $crate::__rkyv::to_bytes::<$crate::__rkyv::rancor::Error>(self)
                    .map(|aligned| aligned.into_vec())
                    .map_err($crate::message::CodecError::Serialize)
            }

            fn unpack(bytes: &[u8]) -> ::std::result::Result<Self, $crate::message::CodecError> {
                let mut aligned = $crate::__rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
                aligned.extend_from_slice(bytes);
                $crate::__rkyv::from_bytes::<Self, $crate::__rkyv::rancor::Error>(&aligned)
                    .map_err($crate::message::CodecError::Deserialize)
            }
        }
    };
}
