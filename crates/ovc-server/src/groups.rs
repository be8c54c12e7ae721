use std::collections::{HashMap, HashSet};

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use ovc_protocol::types::{GroupId, GroupInfo, GroupSettings, PlayerId};

/// Maximum group name length, in characters.
pub const MAX_GROUP_NAME_LEN: usize = 32;

/// Group errors, surfaced to clients verbatim.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GroupError {
    #[error("GROUP_FULL")]
    Full,
    #[error("GROUP_LIMIT_REACHED")]
    LimitReached,
    #[error("NAME_TOO_LONG")]
    NameTooLong,
    #[error("Incorrect password")]
    WrongPassword,
    #[error("NOT_MEMBER")]
    NotMember,
    #[error("NO_SUCH_GROUP")]
    NoSuchGroup,
    #[error("NOT_CREATOR")]
    NotCreator,
}

struct Group {
    id: GroupId,
    name: String,
    creator: PlayerId,
    is_isolated: bool,
    proximity_override: Option<f64>,
    password_hash: Option<[u8; 32]>,
    permanent: bool,
    global_voice: bool,
    spatial: bool,
    min_volume: f64,
    max_members: u32,
    members: HashSet<PlayerId>,
}

impl Group {
    fn info(&self) -> GroupInfo {
        GroupInfo {
            group_id: self.id,
            name: self.name.clone(),
            is_isolated: self.is_isolated,
            has_password: self.password_hash.is_some(),
            permanent: self.permanent,
            member_count: self.members.len() as u32,
            max_members: self.max_members,
        }
    }
}

/// The outcome of a membership mutation, handed back to the signaling layer
/// which performs the `group_members_updated` fanout. The registry does no
/// I/O itself.
#[derive(Debug, Clone)]
pub struct MembershipUpdate {
    pub group_id: GroupId,
    pub members: Vec<PlayerId>,
    pub destroyed: bool,
}

/// Routing-relevant view of the sender's group, cloned out per frame so the
/// router never routes while holding the registry lock.
#[derive(Debug, Clone)]
pub struct RouteGroup {
    pub id: GroupId,
    pub is_isolated: bool,
    pub global_voice: bool,
    pub spatial: bool,
    pub min_volume: f64,
    pub proximity_override: Option<f64>,
    pub members: Vec<PlayerId>,
}

/// How a candidate player relates to the group world, for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Ungrouped,
    Grouped { isolated: bool },
}

/// Snapshot consumed by the audio router for one inbound frame.
#[derive(Debug, Clone)]
pub struct RoutingSnapshot {
    pub sender_group: Option<RouteGroup>,
    membership: HashMap<PlayerId, Membership>,
}

impl RoutingSnapshot {
    pub fn membership_of(&self, player: &PlayerId) -> Membership {
        self.membership
            .get(player)
            .copied()
            .unwrap_or(Membership::Ungrouped)
    }
}

struct Inner {
    groups: HashMap<GroupId, Group>,
    player_group: HashMap<PlayerId, GroupId>,
}

/// Authoritative set of voice groups.
///
/// Invariants enforced on every mutation: a player belongs to at most one
/// group, membership never exceeds `max_members`, and at most `max_groups`
/// groups exist. One registry-level lock serializes mutations, which also
/// fixes a total order for presence events per group.
pub struct GroupRegistry {
    inner: RwLock<Inner>,
    max_groups: usize,
    max_members_cap: u32,
}

impl GroupRegistry {
    pub fn new(max_groups: usize, max_members_cap: u32) -> Self {
        Self {
            inner: RwLock::new(Inner {
                groups: HashMap::new(),
                player_group: HashMap::new(),
            }),
            max_groups,
            max_members_cap,
        }
    }

    /// Create a group and join the creator to it. The creator leaves any
    /// prior group first.
    pub async fn create(
        &self,
        creator: PlayerId,
        name: &str,
        settings: GroupSettings,
    ) -> Result<(GroupInfo, MembershipUpdate, Option<MembershipUpdate>), GroupError> {
        if name.chars().count() > MAX_GROUP_NAME_LEN {
            return Err(GroupError::NameTooLong);
        }

        let mut inner = self.inner.write().await;
        if inner.groups.len() >= self.max_groups {
            return Err(GroupError::LimitReached);
        }

        let left = leave_locked(&mut inner, creator);

        let id = Uuid::new_v4();
        let group = Group {
            id,
            name: name.to_string(),
            creator,
            is_isolated: settings.is_isolated,
            proximity_override: settings.proximity_override,
            password_hash: settings.password.as_deref().map(hash_password),
            permanent: settings.permanent,
            global_voice: settings.global_voice,
            spatial: settings.spatial,
            min_volume: settings.min_volume.clamp(0.0, 1.0),
            max_members: settings.max_members.clamp(1, self.max_members_cap),
            members: HashSet::from([creator]),
        };
        let info = group.info();
        inner.groups.insert(id, group);
        inner.player_group.insert(creator, id);

        debug!(group = %id, name, creator = %creator, "group created");
        Ok((
            info,
            MembershipUpdate {
                group_id: id,
                members: vec![creator],
                destroyed: false,
            },
            left,
        ))
    }

    /// Join a group, leaving any prior group first. Returns the update for
    /// the joined group and, if a prior group was left, that update too.
    pub async fn join(
        &self,
        player: PlayerId,
        group_id: GroupId,
        password: Option<&str>,
    ) -> Result<(MembershipUpdate, Option<MembershipUpdate>), GroupError> {
        let mut inner = self.inner.write().await;

        {
            let group = inner.groups.get(&group_id).ok_or(GroupError::NoSuchGroup)?;
            if let Some(stored) = &group.password_hash {
                let submitted = hash_password(password.unwrap_or(""));
                if !bool::from(stored.ct_eq(&submitted)) {
                    return Err(GroupError::WrongPassword);
                }
            }
            if group.members.contains(&player) {
                // Idempotent re-join.
                return Ok((
                    MembershipUpdate {
                        group_id,
                        members: group.members.iter().copied().collect(),
                        destroyed: false,
                    },
                    None,
                ));
            }
            if group.members.len() >= group.max_members as usize {
                return Err(GroupError::Full);
            }
        }

        let left = leave_locked(&mut inner, player);

        let group = inner
            .groups
            .get_mut(&group_id)
            .ok_or(GroupError::NoSuchGroup)?;
        group.members.insert(player);
        let members = group.members.iter().copied().collect();
        inner.player_group.insert(player, group_id);

        Ok((
            MembershipUpdate {
                group_id,
                members,
                destroyed: false,
            },
            left,
        ))
    }

    /// Leave the player's current group. Non-permanent groups are destroyed
    /// the moment the last member leaves.
    pub async fn leave(&self, player: PlayerId) -> Result<MembershipUpdate, GroupError> {
        let mut inner = self.inner.write().await;
        leave_locked(&mut inner, player).ok_or(GroupError::NotMember)
    }

    /// Replace a group's settings. Creator only; membership is untouched and
    /// the capacity cap never evicts existing members.
    pub async fn update_settings(
        &self,
        player: PlayerId,
        group_id: GroupId,
        settings: GroupSettings,
    ) -> Result<GroupInfo, GroupError> {
        let mut inner = self.inner.write().await;
        let group = inner
            .groups
            .get_mut(&group_id)
            .ok_or(GroupError::NoSuchGroup)?;
        if group.creator != player {
            return Err(GroupError::NotCreator);
        }

        group.is_isolated = settings.is_isolated;
        group.proximity_override = settings.proximity_override;
        group.password_hash = settings.password.as_deref().map(hash_password);
        group.permanent = settings.permanent;
        group.global_voice = settings.global_voice;
        group.spatial = settings.spatial;
        group.min_volume = settings.min_volume.clamp(0.0, 1.0);
        group.max_members = settings
            .max_members
            .clamp(1, self.max_members_cap)
            .max(group.members.len() as u32);

        Ok(group.info())
    }

    pub async fn list(&self) -> Vec<GroupInfo> {
        let inner = self.inner.read().await;
        let mut groups: Vec<GroupInfo> = inner.groups.values().map(Group::info).collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        groups
    }

    pub async fn group_of(&self, player: &PlayerId) -> Option<GroupId> {
        self.inner.read().await.player_group.get(player).copied()
    }

    pub async fn members(&self, group_id: &GroupId) -> Vec<PlayerId> {
        let inner = self.inner.read().await;
        inner
            .groups
            .get(group_id)
            .map(|g| g.members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Destroy an empty, non-permanent group. Used by maintenance paths;
    /// the leave path already destroys eagerly.
    pub async fn destroy_if_empty(&self, group_id: GroupId) -> bool {
        let mut inner = self.inner.write().await;
        let Some(group) = inner.groups.get(&group_id) else {
            return false;
        };
        if group.permanent || !group.members.is_empty() {
            return false;
        }
        inner.groups.remove(&group_id);
        true
    }

    /// Clone out everything the router needs for one frame from `sender`.
    pub async fn routing_snapshot(&self, sender: &PlayerId) -> RoutingSnapshot {
        let inner = self.inner.read().await;

        let sender_group = inner
            .player_group
            .get(sender)
            .and_then(|gid| inner.groups.get(gid))
            .map(|g| RouteGroup {
                id: g.id,
                is_isolated: g.is_isolated,
                global_voice: g.global_voice,
                spatial: g.spatial,
                min_volume: g.min_volume,
                proximity_override: g.proximity_override,
                members: g.members.iter().copied().collect(),
            });

        let membership = inner
            .player_group
            .iter()
            .filter_map(|(player, gid)| {
                inner.groups.get(gid).map(|g| {
                    (
                        *player,
                        Membership::Grouped {
                            isolated: g.is_isolated,
                        },
                    )
                })
            })
            .collect();

        RoutingSnapshot {
            sender_group,
            membership,
        }
    }
}

fn leave_locked(inner: &mut Inner, player: PlayerId) -> Option<MembershipUpdate> {
    let group_id = inner.player_group.remove(&player)?;
    let group = inner.groups.get_mut(&group_id)?;
    if !group.members.remove(&player) {
        return None;
    }

    let destroyed = group.members.is_empty() && !group.permanent;
    let members: Vec<PlayerId> = group.members.iter().copied().collect();
    if destroyed {
        inner.groups.remove(&group_id);
        debug!(group = %group_id, "empty group destroyed");
    }

    Some(MembershipUpdate {
        group_id,
        members,
        destroyed,
    })
}

fn hash_password(password: &str) -> [u8; 32] {
    Sha256::digest(password.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> GroupRegistry {
        GroupRegistry::new(100, 200)
    }

    fn settings() -> GroupSettings {
        GroupSettings::default()
    }

    #[tokio::test]
    async fn create_joins_creator() {
        let reg = registry();
        let alice = Uuid::new_v4();
        let (info, update, left) = reg.create(alice, "party", settings()).await.unwrap();
        assert_eq!(info.name, "party");
        assert_eq!(info.member_count, 1);
        assert_eq!(update.members, vec![alice]);
        assert!(left.is_none());
        assert_eq!(reg.group_of(&alice).await, Some(info.group_id));
    }

    #[tokio::test]
    async fn name_too_long_rejected() {
        let reg = registry();
        let name = "x".repeat(MAX_GROUP_NAME_LEN + 1);
        let err = reg.create(Uuid::new_v4(), &name, settings()).await;
        assert_eq!(err.unwrap_err(), GroupError::NameTooLong);
    }

    #[tokio::test]
    async fn group_limit_enforced() {
        let reg = GroupRegistry::new(2, 200);
        reg.create(Uuid::new_v4(), "a", settings()).await.unwrap();
        reg.create(Uuid::new_v4(), "b", settings()).await.unwrap();
        let err = reg.create(Uuid::new_v4(), "c", settings()).await;
        assert_eq!(err.unwrap_err(), GroupError::LimitReached);
    }

    #[tokio::test]
    async fn join_requires_password() {
        let reg = registry();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let mut s = settings();
        s.password = Some("swordfish".into());
        let (info, ..) = reg.create(alice, "secret", s).await.unwrap();

        let err = reg.join(bob, info.group_id, Some("wrong")).await;
        assert_eq!(err.unwrap_err(), GroupError::WrongPassword);
        let err = reg.join(bob, info.group_id, None).await;
        assert_eq!(err.unwrap_err(), GroupError::WrongPassword);

        let (update, _) = reg.join(bob, info.group_id, Some("swordfish")).await.unwrap();
        assert!(update.members.contains(&bob));
    }

    #[tokio::test]
    async fn join_full_group_rejected() {
        let reg = registry();
        let alice = Uuid::new_v4();
        let mut s = settings();
        s.max_members = 1;
        let (info, ..) = reg.create(alice, "tiny", s).await.unwrap();
        let err = reg.join(Uuid::new_v4(), info.group_id, None).await;
        assert_eq!(err.unwrap_err(), GroupError::Full);
    }

    #[tokio::test]
    async fn player_in_at_most_one_group() {
        let reg = registry();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (first, ..) = reg.create(alice, "first", settings()).await.unwrap();
        let (second, ..) = reg.create(bob, "second", settings()).await.unwrap();

        let (update, left) = reg.join(alice, second.group_id, None).await.unwrap();
        assert_eq!(update.group_id, second.group_id);
        // Alice's old single-member group was destroyed when she left it.
        let left = left.unwrap();
        assert_eq!(left.group_id, first.group_id);
        assert!(left.destroyed);
        assert_eq!(reg.group_of(&alice).await, Some(second.group_id));
        assert_eq!(reg.list().await.len(), 1);
    }

    #[tokio::test]
    async fn rejoin_is_idempotent() {
        let reg = registry();
        let alice = Uuid::new_v4();
        let (info, ..) = reg.create(alice, "party", settings()).await.unwrap();
        let (update, left) = reg.join(alice, info.group_id, None).await.unwrap();
        assert_eq!(update.members, vec![alice]);
        assert!(left.is_none());
    }

    #[tokio::test]
    async fn leave_destroys_empty_group() {
        let reg = registry();
        let alice = Uuid::new_v4();
        let (info, ..) = reg.create(alice, "party", settings()).await.unwrap();
        let update = reg.leave(alice).await.unwrap();
        assert!(update.destroyed);
        assert!(reg.members(&info.group_id).await.is_empty());
        assert!(reg.list().await.is_empty());
    }

    #[tokio::test]
    async fn permanent_group_survives_emptiness() {
        let reg = registry();
        let alice = Uuid::new_v4();
        let mut s = settings();
        s.permanent = true;
        let (info, ..) = reg.create(alice, "lobby", s).await.unwrap();
        let update = reg.leave(alice).await.unwrap();
        assert!(!update.destroyed);
        assert_eq!(reg.list().await.len(), 1);
        assert!(!reg.destroy_if_empty(info.group_id).await);
    }

    #[tokio::test]
    async fn leave_without_group_is_not_member() {
        let reg = registry();
        assert_eq!(reg.leave(Uuid::new_v4()).await.unwrap_err(), GroupError::NotMember);
    }

    #[tokio::test]
    async fn join_unknown_group() {
        let reg = registry();
        let err = reg.join(Uuid::new_v4(), Uuid::new_v4(), None).await;
        assert_eq!(err.unwrap_err(), GroupError::NoSuchGroup);
    }

    #[tokio::test]
    async fn update_settings_creator_only() {
        let reg = registry();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (info, ..) = reg.create(alice, "party", settings()).await.unwrap();

        let mut s = settings();
        s.is_isolated = true;
        let err = reg.update_settings(bob, info.group_id, s.clone()).await;
        assert_eq!(err.unwrap_err(), GroupError::NotCreator);

        let updated = reg.update_settings(alice, info.group_id, s).await.unwrap();
        assert!(updated.is_isolated);
    }

    #[tokio::test]
    async fn update_never_caps_below_membership() {
        let reg = registry();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (info, ..) = reg.create(alice, "party", settings()).await.unwrap();
        reg.join(bob, info.group_id, None).await.unwrap();

        let mut s = settings();
        s.max_members = 1;
        let updated = reg.update_settings(alice, info.group_id, s).await.unwrap();
        assert_eq!(updated.max_members, 2);
    }

    #[tokio::test]
    async fn membership_invariants_after_churn() {
        let reg = registry();
        let players: Vec<PlayerId> = (0..8).map(|_| Uuid::new_v4()).collect();
        let (a, ..) = reg.create(players[0], "a", settings()).await.unwrap();
        let (b, ..) = reg.create(players[1], "b", settings()).await.unwrap();

        for (i, p) in players.iter().enumerate().skip(2) {
            let target = if i % 2 == 0 { a.group_id } else { b.group_id };
            reg.join(*p, target, None).await.unwrap();
        }
        // Everyone hops to the other group.
        for (i, p) in players.iter().enumerate().skip(2) {
            let target = if i % 2 == 0 { b.group_id } else { a.group_id };
            reg.join(*p, target, None).await.unwrap();
        }

        let members_a = reg.members(&a.group_id).await;
        let members_b = reg.members(&b.group_id).await;
        for p in &players {
            let in_a = members_a.contains(p);
            let in_b = members_b.contains(p);
            assert!(!(in_a && in_b), "player in two groups");
        }
        assert_eq!(members_a.len() + members_b.len(), players.len());
    }

    #[tokio::test]
    async fn routing_snapshot_contents() {
        let reg = registry();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let carol = Uuid::new_v4();
        let mut s = settings();
        s.is_isolated = true;
        let (info, ..) = reg.create(alice, "iso", s).await.unwrap();
        reg.join(bob, info.group_id, None).await.unwrap();

        let snap = reg.routing_snapshot(&alice).await;
        let group = snap.sender_group.as_ref().unwrap();
        assert!(group.is_isolated);
        assert_eq!(group.members.len(), 2);
        assert_eq!(
            snap.membership_of(&bob),
            Membership::Grouped { isolated: true }
        );
        assert_eq!(snap.membership_of(&carol), Membership::Ungrouped);

        let snap = reg.routing_snapshot(&carol).await;
        assert!(snap.sender_group.is_none());
    }
}
