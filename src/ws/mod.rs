pub mod protocol;
pub mod sessions;
pub mod persist;
pub mod room;
pub mod registry;
pub mod handler;

pub use registry::{RoomHandle, RoomRegistry};
pub use room::{RoomCommand, RoomCoordinator, RoomPhase, RoomServices, RoomStats};
pub use sessions::{ConnId, Outbound, OutboundTx, Session, SessionRegistry};
