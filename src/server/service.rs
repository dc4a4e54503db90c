//! Room-scoped message relay.
//!
//! Room membership is mutated under a per-room mutex so simultaneous joins and
//! leaves cannot lose roster updates. Delivery goes through each member's
//! unbounded queue, so a slow reader never stalls a fan-out.

use super::room::{Member, MemberSender, Room};
use crate::error::{Error, Result};
use crate::protocol::{ClientMessage, JoinInfo, MemberId, MemberInfo, Role, ServerMessage};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

struct Connection {
    sender: MemberSender,
    room_id: Option<String>,
}

#[derive(Default)]
pub struct SignalingService {
    rooms: RwLock<HashMap<String, Arc<Mutex<Room>>>>,
    connections: RwLock<HashMap<MemberId, Connection>>,
}

impl SignalingService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new signaling connection and returns its id and inbound queue.
    pub async fn connect(&self) -> (MemberId, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let member_id = Uuid::new_v4().to_string();
        self.connections.write().await.insert(
            member_id.clone(),
            Connection {
                sender: tx,
                room_id: None,
            },
        );
        debug!("Connection {} registered", member_id);
        (member_id, rx)
    }

    /// Transport-level disconnect: leaves the room, then forgets the connection.
    pub async fn disconnect(&self, member_id: &str) {
        self.leave(member_id).await;
        self.connections.write().await.remove(member_id);
        debug!("Connection {} dropped", member_id);
    }

    pub async fn handle(&self, member_id: &str, msg: ClientMessage) {
        let outcome = match msg {
            ClientMessage::Join(info) => {
                let observe = info.role.is_observer();
                self.join(member_id, info, observe).await
            }
            ClientMessage::Observe(info) => self.join(member_id, info, true).await,
            ClientMessage::Relay {
                target_member_id,
                payload,
            } => self.relay(member_id, &target_member_id, payload).await.map(|_| ()),
            ClientMessage::Broadcast { payload } => {
                self.broadcast(member_id, payload, true).await.map(|_| ())
            }
            ClientMessage::Leave => {
                self.leave(member_id).await;
                Ok(())
            }
        };

        if let Err(e) = outcome {
            warn!("Rejected message from {}: {}", member_id, e);
            self.reply(
                member_id,
                ServerMessage::Error {
                    message: e.to_string(),
                },
            )
            .await;
        }
    }

    /// Adds the caller to `info.room_id`, creating the room if needed.
    ///
    /// The caller receives the participants already present. Unless it is
    /// observing, everyone already in the room is told about it.
    pub async fn join(&self, member_id: &str, info: JoinInfo, observe: bool) -> Result<()> {
        let sender = {
            let connections = self.connections.read().await;
            let conn = connections
                .get(member_id)
                .ok_or_else(|| Error::InvalidState(format!("unknown connection {}", member_id)))?;
            if let Some(room_id) = &conn.room_id {
                return Err(Error::InvalidState(format!("already joined room {}", room_id)));
            }
            conn.sender.clone()
        };

        let member = Member {
            id: member_id.to_string(),
            user_id: info.user_id,
            user_name: info.user_name,
            role: if observe { Role::Observer } else { info.role },
            sender,
        };

        loop {
            let handle = {
                let mut rooms = self.rooms.write().await;
                rooms
                    .entry(info.room_id.clone())
                    .or_insert_with(|| {
                        info!("Room {} created", info.room_id);
                        Arc::new(Mutex::new(Room::new(info.room_id.clone())))
                    })
                    .clone()
            };

            let mut room = handle.lock().await;
            if room.closed {
                // Emptied and unlinked between lookup and lock; look it up again.
                continue;
            }

            let existing: Vec<MemberInfo> = room.participants().map(Member::info).collect();
            member.deliver(ServerMessage::ExistingMembers { members: existing });

            if !observe {
                let announcement = ServerMessage::MemberJoined(member.info());
                for other in room.members() {
                    other.deliver(announcement.clone());
                }
            }

            info!(
                "{} {} ({}) in room {} as {}",
                member_id,
                if observe { "observing" } else { "joined" },
                member.user_name,
                room.id,
                member.role
            );
            room.insert(member);

            if let Some(conn) = self.connections.write().await.get_mut(member_id) {
                conn.room_id = Some(info.room_id.clone());
            }
            return Ok(());
        }
    }

    /// Forwards `payload` to one member of the sender's room. Returns whether it was queued.
    pub async fn relay(&self, from: &str, target: &str, payload: Value) -> Result<bool> {
        let handle = self.room_of(from).await?;
        let room = handle.lock().await;
        match room.get(target) {
            Some(member) => Ok(member.deliver(ServerMessage::Relayed {
                from_member_id: from.to_string(),
                payload,
            })),
            None => {
                debug!("Relay from {} to absent member {} dropped", from, target);
                Ok(false)
            }
        }
    }

    /// Forwards `payload` to every other member of the sender's room. Returns the fan-out size.
    pub async fn broadcast(&self, from: &str, payload: Value, exclude_self: bool) -> Result<usize> {
        let handle = self.room_of(from).await?;
        let room = handle.lock().await;
        let msg = ServerMessage::Relayed {
            from_member_id: from.to_string(),
            payload,
        };
        let delivered = room
            .members()
            .filter(|m| !(exclude_self && m.id == from))
            .filter(|m| m.deliver(msg.clone()))
            .count();
        Ok(delivered)
    }

    /// Removes the member from its room, if any, and tells the remainder.
    pub async fn leave(&self, member_id: &str) {
        let room_id = {
            let mut connections = self.connections.write().await;
            match connections.get_mut(member_id) {
                Some(conn) => conn.room_id.take(),
                None => None,
            }
        };
        let Some(room_id) = room_id else {
            return;
        };
        let Some(handle) = self.rooms.read().await.get(&room_id).cloned() else {
            return;
        };

        let mut room = handle.lock().await;
        let Some(gone) = room.remove(member_id) else {
            return;
        };
        info!("{} ({}) left room {}", member_id, gone.user_name, room_id);

        if !gone.role.is_observer() {
            let notice = ServerMessage::MemberLeft {
                member_id: member_id.to_string(),
            };
            for other in room.members() {
                other.deliver(notice.clone());
            }
        }

        if room.is_empty() {
            room.closed = true;
            let mut rooms = self.rooms.write().await;
            if rooms.get(&room_id).is_some_and(|r| Arc::ptr_eq(r, &handle)) {
                rooms.remove(&room_id);
                info!("Room {} destroyed", room_id);
            }
        }
    }

    /// Current participants of a room in arrival order.
    pub async fn roster(&self, room_id: &str) -> Vec<MemberInfo> {
        let Some(handle) = self.rooms.read().await.get(room_id).cloned() else {
            return Vec::new();
        };
        let room = handle.lock().await;
        room.participants().map(Member::info).collect()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    async fn room_of(&self, member_id: &str) -> Result<Arc<Mutex<Room>>> {
        let room_id = self
            .connections
            .read()
            .await
            .get(member_id)
            .and_then(|c| c.room_id.clone())
            .ok_or_else(|| Error::InvalidState("not in a room".to_string()))?;
        self.rooms
            .read()
            .await
            .get(&room_id)
            .cloned()
            .ok_or_else(|| Error::InvalidState(format!("room {} is gone", room_id)))
    }

    async fn reply(&self, member_id: &str, msg: ServerMessage) {
        if let Some(conn) = self.connections.read().await.get(member_id) {
            let _ = conn.sender.send(msg);
        }
    }
}
