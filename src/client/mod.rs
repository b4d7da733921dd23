//! Peer side of the room protocol: a local mirror of the room, echo
//! suppression, cursor throttling and reconnect with backoff.
pub mod mirror;
pub mod throttle;
pub mod reconnect;
pub mod tokens;
pub mod driver;

pub use driver::{ClientConfig, ClientError, ClientEvent, ClientHandle, MirrorSnapshot, SyncClient};
pub use mirror::{Mirror, RemoteCursor};
pub use reconnect::{ConnectionStatus, ReconnectPolicy, ReconnectStep, Reconnector};
pub use throttle::CursorThrottle;
pub use tokens::{HttpTokenSource, StaticToken, TokenFn, TokenSource};
