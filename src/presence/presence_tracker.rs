use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

/// Rooms this session currently holds membership in.
///
/// Shared between the presence tracker (to filter stale events) and the
/// channel driver (to re-establish membership after a reconnect; the
/// authority does not carry room membership across transport connections).
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: DashMap<Uuid, ()>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, room_id: Uuid) {
        self.rooms.insert(room_id, ());
    }

    pub fn remove(&self, room_id: Uuid) {
        self.rooms.remove(&room_id);
    }

    pub fn contains(&self, room_id: Uuid) -> bool {
        self.rooms.contains_key(&room_id)
    }

    pub fn all(&self) -> Vec<Uuid> {
        self.rooms.iter().map(|entry| *entry.key()).collect()
    }
}

/// Per-room presence, derived entirely from join/leave events and
/// `presence_sync` reconciliation. Never persisted; a disconnected session
/// cannot vouch for anyone's presence, so the whole cache is dropped on
/// every disconnect and rebuilt from fresh events.
pub struct PresenceTracker {
    local_user: Uuid,
    registry: Arc<RoomRegistry>,
    presence: DashMap<Uuid, HashSet<Uuid>>,
}

impl PresenceTracker {
    pub fn new(local_user: Uuid, registry: Arc<RoomRegistry>) -> Self {
        Self {
            local_user,
            registry,
            presence: DashMap::new(),
        }
    }

    pub fn local_user(&self) -> Uuid {
        self.local_user
    }

    /// Start tracking a room and count the local user as present right away.
    /// The authority does not echo a join back to its originator, so waiting
    /// for an event would leave the local user invisible to itself.
    pub fn join(&self, room_id: Uuid) {
        self.registry.add(room_id);
        self.presence
            .entry(room_id)
            .or_default()
            .insert(self.local_user);
        tracing::info!("Joined room {room_id}");
    }

    /// Stop tracking a room. Tracking state resets first so an event for the
    /// old room arriving mid-leave is already stale.
    pub fn leave(&self, room_id: Uuid) {
        self.registry.remove(room_id);
        self.presence.remove(&room_id);
        tracing::info!("Left room {room_id}");
    }

    pub fn presence(&self, room_id: Uuid) -> HashSet<Uuid> {
        self.presence
            .get(&room_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn apply_user_joined(&self, user_id: Uuid, room_id: Uuid) {
        if !self.registry.contains(room_id) {
            tracing::debug!("Ignoring join of {user_id} for untracked room {room_id}");
            return;
        }
        self.presence.entry(room_id).or_default().insert(user_id);
    }

    pub fn apply_user_left(&self, user_id: Uuid, room_id: Uuid) {
        if !self.registry.contains(room_id) {
            tracing::debug!("Ignoring leave of {user_id} for untracked room {room_id}");
            return;
        }
        if let Some(mut entry) = self.presence.get_mut(&room_id) {
            entry.remove(&user_id);
        }
    }

    /// Authoritative full-room sync: the local set becomes exactly the
    /// event's list in one insert, so readers never observe a transient
    /// empty set while the correction lands.
    pub fn apply_presence_sync(&self, room_id: Uuid, active_user_ids: Vec<Uuid>) {
        if !self.registry.contains(room_id) {
            tracing::debug!("Ignoring presence sync for untracked room {room_id}");
            return;
        }
        self.presence
            .insert(room_id, active_user_ids.into_iter().collect());
    }

    /// Drop every cached set. Room tracking survives so the channel can
    /// re-join after a reconnect.
    pub fn clear_presence(&self) {
        self.presence.clear();
    }

    /// Drop everything cached for one room without touching the others.
    pub fn evict_room(&self, room_id: Uuid) {
        self.registry.remove(room_id);
        self.presence.remove(&room_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> (PresenceTracker, Uuid) {
        let local = Uuid::new_v4();
        (
            PresenceTracker::new(local, Arc::new(RoomRegistry::new())),
            local,
        )
    }

    #[test]
    fn test_join_counts_local_user_immediately() {
        let (tracker, local) = tracker();
        let room = Uuid::new_v4();
        tracker.join(room);
        assert!(tracker.presence(room).contains(&local));
    }

    #[test]
    fn test_events_for_untracked_rooms_are_stale() {
        let (tracker, _) = tracker();
        let room = Uuid::new_v4();
        tracker.apply_user_joined(Uuid::new_v4(), room);
        assert!(tracker.presence(room).is_empty());

        tracker.join(room);
        tracker.leave(room);
        // Late event for a room we already left.
        tracker.apply_user_joined(Uuid::new_v4(), room);
        assert!(tracker.presence(room).is_empty());
    }

    #[test]
    fn test_presence_sync_replaces_drifted_set() {
        let (tracker, local) = tracker();
        let room = Uuid::new_v4();
        tracker.join(room);
        tracker.apply_user_joined(Uuid::new_v4(), room);

        let truth = vec![local, Uuid::new_v4(), Uuid::new_v4()];
        tracker.apply_presence_sync(room, truth.clone());
        assert_eq!(
            tracker.presence(room),
            truth.into_iter().collect::<HashSet<_>>()
        );
    }

    #[test]
    fn test_sync_applied_twice_is_stable() {
        let (tracker, _) = tracker();
        let room = Uuid::new_v4();
        tracker.join(room);
        let truth = vec![Uuid::new_v4()];
        tracker.apply_presence_sync(room, truth.clone());
        let first = tracker.presence(room);
        tracker.apply_presence_sync(room, truth);
        assert_eq!(tracker.presence(room), first);
    }

    #[test]
    fn test_disconnect_clears_presence_but_keeps_rooms() {
        let (tracker, _) = tracker();
        let room = Uuid::new_v4();
        tracker.join(room);
        tracker.clear_presence();
        assert!(tracker.presence(room).is_empty());
        // Still tracked: a fresh sync for the room applies.
        tracker.apply_presence_sync(room, vec![Uuid::new_v4()]);
        assert_eq!(tracker.presence(room).len(), 1);
    }

    #[test]
    fn test_leave_only_clears_that_room() {
        let (tracker, local) = tracker();
        let kept = Uuid::new_v4();
        let left = Uuid::new_v4();
        tracker.join(kept);
        tracker.join(left);
        tracker.leave(left);
        assert!(tracker.presence(kept).contains(&local));
        assert!(tracker.presence(left).is_empty());
    }
}
