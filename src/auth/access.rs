use async_trait::async_trait;
use moka::future::Cache;
use std::time::Duration;
use tracing::info;

use super::principals::is_cloud_admin;
use super::Identity;

/// The "may this identity open this room" predicate.
///
/// Board membership and invites live in another service; this crate only
/// consumes the answer.
#[async_trait]
pub trait RoomAccess: Send + Sync {
    async fn may_open(&self, room_id: &str, identity: &Identity) -> bool;
}

/// Any verified identity may open any room.
pub struct OpenAccess;

#[async_trait]
impl RoomAccess for OpenAccess {
    async fn may_open(&self, _room_id: &str, _identity: &Identity) -> bool {
        true
    }
}

/// Rooms named `org/board` are restricted to members of `org`.
/// Rooms without an org prefix are open to every verified identity.
pub struct OrgScopedAccess;

#[async_trait]
impl RoomAccess for OrgScopedAccess {
    async fn may_open(&self, room_id: &str, identity: &Identity) -> bool {
        if is_cloud_admin(identity) {
            return true;
        }
        match room_id.split_once('/') {
            Some((org, _)) => identity.organization.as_deref() == Some(org),
            None => true,
        }
    }
}

/// Caches decisions of another predicate per (room, subject).
pub struct CachedAccess<A> {
    inner: A,
    cache: Cache<(String, String), bool>,
}

impl<A: RoomAccess> CachedAccess<A> {
    pub fn new(inner: A, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(100_000)
            .time_to_live(ttl)
            .build();
        info!("Room access cache initialized");
        Self { inner, cache }
    }
}

#[async_trait]
impl<A: RoomAccess> RoomAccess for CachedAccess<A> {
    async fn may_open(&self, room_id: &str, identity: &Identity) -> bool {
        let key = (room_id.to_string(), identity.subject.clone());
        self.cache
            .get_with(key, self.inner.may_open(room_id, identity))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn member(org: Option<&str>) -> Identity {
        Identity {
            subject: "user_1".into(),
            organization: org.map(str::to_string),
            email: None,
            roles: vec![],
        }
    }

    #[tokio::test]
    async fn org_rooms_require_membership() {
        let access = OrgScopedAccess;
        assert!(access.may_open("acme/board-1", &member(Some("acme"))).await);
        assert!(!access.may_open("acme/board-1", &member(Some("other"))).await);
        assert!(!access.may_open("acme/board-1", &member(None)).await);
        assert!(access.may_open("scratch", &member(None)).await);
    }

    #[tokio::test]
    async fn cloud_admins_open_everything() {
        let mut admin = member(None);
        admin.roles.push("Colabri-CloudAdmin".into());
        assert!(OrgScopedAccess.may_open("acme/board-1", &admin).await);
    }

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl RoomAccess for Counting {
        async fn may_open(&self, _room_id: &str, _identity: &Identity) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[tokio::test]
    async fn cached_access_asks_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let access = CachedAccess::new(Counting(calls.clone()), Duration::from_secs(60));
        for _ in 0..3 {
            assert!(access.may_open("room", &member(None)).await);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
