pub mod gate;
pub mod access;
pub mod principals;

pub use gate::{AuthFailure, AuthGate, Identity};
pub use access::{CachedAccess, OpenAccess, OrgScopedAccess, RoomAccess};
