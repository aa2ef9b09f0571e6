//! Wire messages: JSON envelopes on the signaling socket, MessagePack
//! envelopes on data channels.

pub mod signaling;
pub mod transfer;
