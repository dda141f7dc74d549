//! Realtime gateway: authenticated duplex socket, room fan-out, typing,
//! message push, and the voice signaling entrypoints.

pub mod handler;
pub mod protocol;
pub mod rooms;
