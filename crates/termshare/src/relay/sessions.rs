//! Room bookkeeping for the relay.
//!
//! One table maps session identifiers to rooms; each room maps member keys to
//! relay connections. Forwarding takes a snapshot of the target handles under
//! the read lock and performs the writes after releasing it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use protocol::{Envelope, PeerId};
use tokio::sync::RwLock;

use crate::network::RelayHandle;

/// One connected member of a room.
#[derive(Clone)]
struct Member {
    /// Unique per connection, so one connection is never present twice.
    serial: u64,
    /// True while the key is relay-minted rather than the member's own PeerID.
    anonymous: bool,
    handle: RelayHandle,
}

#[derive(Default)]
struct Room {
    members: HashMap<PeerId, Member>,
}

impl Room {
    fn key_of(&self, serial: u64) -> Option<&PeerId> {
        self.members
            .iter()
            .find(|(_, member)| member.serial == serial)
            .map(|(key, _)| key)
    }
}

/// Identifies one member connection inside the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    session_id: String,
    serial: u64,
}

impl Membership {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

/// The relay's session table.
#[derive(Default)]
pub struct SessionTable {
    rooms: RwLock<HashMap<String, Room>>,
    next_serial: AtomicU64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection to a session, creating the session if needed.
    ///
    /// Without a `peer` the member gets an anonymous key until it sends an
    /// envelope carrying its own `from`. A member already holding `peer` is
    /// replaced and its connection closed.
    pub async fn join(
        &self,
        session_id: &str,
        peer: Option<PeerId>,
        handle: RelayHandle,
    ) -> Membership {
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        let (key, anonymous) = match peer {
            Some(peer) => (peer, false),
            None => (PeerId::new(format!("anon-{}", serial)), true),
        };

        let stale = {
            let mut rooms = self.rooms.write().await;
            let room = rooms.entry(session_id.to_string()).or_default();
            room.members.insert(
                key.clone(),
                Member {
                    serial,
                    anonymous,
                    handle,
                },
            )
        };

        tracing::info!(session_id = %session_id, peer_id = %key, "Member joined");

        if let Some(stale) = stale {
            tracing::info!(session_id = %session_id, peer_id = %key, "Replacing stale member");
            tokio::spawn(async move {
                stale.handle.close("replaced by a newer connection").await;
            });
        }

        Membership {
            session_id: session_id.to_string(),
            serial,
        }
    }

    /// Removes a member. The session disappears with its last member.
    ///
    /// Returns false if the member was already gone.
    pub async fn leave(&self, membership: &Membership) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(&membership.session_id) else {
            return false;
        };

        let key = room.key_of(membership.serial).cloned();
        let removed = match key {
            Some(key) => {
                room.members.remove(&key);
                tracing::info!(session_id = %membership.session_id, peer_id = %key, "Member left");
                true
            }
            None => false,
        };

        if room.members.is_empty() {
            rooms.remove(&membership.session_id);
            tracing::info!(session_id = %membership.session_id, "Session closed");
        }

        removed
    }

    /// Forwards an envelope from `sender` to the rest of its session.
    ///
    /// Without `to` every other member receives it. With `to` only that member
    /// does; an unknown recipient drops the envelope. Returns the number of
    /// members the envelope was queued for. A member whose outbound queue is
    /// full misses the envelope.
    pub async fn route(&self, sender: &Membership, envelope: Envelope) -> usize {
        if let Some(claimed) = &envelope.from {
            self.learn_identity(sender, claimed).await;
        }

        let targets: Vec<(PeerId, RelayHandle)> = {
            let rooms = self.rooms.read().await;
            let Some(room) = rooms.get(&sender.session_id) else {
                return 0;
            };

            match &envelope.to {
                Some(to) => room
                    .members
                    .get(to)
                    .filter(|member| member.serial != sender.serial)
                    .map(|member| vec![(to.clone(), member.handle.clone())])
                    .unwrap_or_default(),
                None => room
                    .members
                    .iter()
                    .filter(|(_, member)| member.serial != sender.serial)
                    .map(|(key, member)| (key.clone(), member.handle.clone()))
                    .collect(),
            }
        };

        if targets.is_empty() {
            tracing::debug!(
                session_id = %sender.session_id,
                kind = %envelope.kind(),
                to = ?envelope.to,
                "No recipient for envelope"
            );
            return 0;
        }

        // A member that stops reading must not stall the rest of the room.
        let mut delivered = 0;
        for (peer_id, handle) in targets {
            match handle.try_send(envelope.clone()) {
                Ok(()) => delivered += 1,
                // The member is leaving; its own task removes it.
                Err(e) if e.is_connection_closed() => {
                    tracing::debug!(peer_id = %peer_id, error = %e, "Forward failed")
                }
                Err(e) => {
                    tracing::warn!(peer_id = %peer_id, error = %e, "Dropping envelope for slow member")
                }
            }
        }
        delivered
    }

    /// Re-keys an anonymous member under the PeerID it claims, if still free.
    async fn learn_identity(&self, member: &Membership, claimed: &PeerId) {
        {
            let rooms = self.rooms.read().await;
            let Some(room) = rooms.get(&member.session_id) else {
                return;
            };
            if room.members.contains_key(claimed) {
                return;
            }
            let anonymous = room
                .members
                .values()
                .any(|m| m.serial == member.serial && m.anonymous);
            if !anonymous {
                return;
            }
        }

        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(&member.session_id) else {
            return;
        };
        if room.members.contains_key(claimed) {
            return;
        }
        let Some(old_key) = room.key_of(member.serial).cloned() else {
            return;
        };
        if let Some(mut entry) = room.members.remove(&old_key) {
            entry.anonymous = false;
            room.members.insert(claimed.clone(), entry);
            tracing::debug!(
                session_id = %member.session_id,
                from = %old_key,
                to = %claimed,
                "Learned member identity"
            );
        }
    }

    /// Closes every member connection, e.g. on relay shutdown.
    pub async fn close_all(&self, reason: &str) {
        let handles: Vec<RelayHandle> = {
            let rooms = self.rooms.read().await;
            rooms
                .values()
                .flat_map(|room| room.members.values().map(|m| m.handle.clone()))
                .collect()
        };
        for handle in handles {
            handle.close(reason).await;
        }
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Keys of the members of a session, sorted.
    pub async fn members(&self, session_id: &str) -> Vec<PeerId> {
        let rooms = self.rooms.read().await;
        let mut members: Vec<PeerId> = rooms
            .get(session_id)
            .map(|room| room.members.keys().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }
}
