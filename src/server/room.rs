use crate::protocol::{MemberId, MemberInfo, Role, ServerMessage};
use tokio::sync::mpsc;

/// Outbound queue of one signaling connection.
pub type MemberSender = mpsc::UnboundedSender<ServerMessage>;

#[derive(Debug, Clone)]
pub struct Member {
    pub id: MemberId,
    pub user_id: String,
    pub user_name: String,
    pub role: Role,
    pub sender: MemberSender,
}

impl Member {
    pub fn info(&self) -> MemberInfo {
        MemberInfo {
            member_id: self.id.clone(),
            user_name: self.user_name.clone(),
        }
    }

    /// Best-effort delivery; a closed queue means the member is already leaving.
    pub fn deliver(&self, msg: ServerMessage) -> bool {
        self.sender.send(msg).is_ok()
    }
}

/// Members of one room in arrival order.
#[derive(Debug)]
pub struct Room {
    pub id: String,
    members: Vec<Member>,
    /// Set once the room has been emptied and unlinked from the registry.
    pub closed: bool,
}

impl Room {
    pub fn new(id: String) -> Self {
        Self {
            id,
            members: Vec::new(),
            closed: false,
        }
    }

    pub fn contains(&self, member_id: &str) -> bool {
        self.members.iter().any(|m| m.id == member_id)
    }

    pub fn get(&self, member_id: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.id == member_id)
    }

    pub fn insert(&mut self, member: Member) -> bool {
        if self.contains(&member.id) {
            return false;
        }
        self.members.push(member);
        true
    }

    pub fn remove(&mut self, member_id: &str) -> Option<Member> {
        let idx = self.members.iter().position(|m| m.id == member_id)?;
        Some(self.members.remove(idx))
    }

    /// Negotiation targets: everyone except observers, oldest first.
    pub fn participants(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| !m.role.is_observer())
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str, role: Role) -> Member {
        let (tx, _rx) = mpsc::unbounded_channel();
        Member {
            id: id.into(),
            user_id: format!("u-{}", id),
            user_name: id.to_uppercase(),
            role,
            sender: tx,
        }
    }

    #[test]
    fn test_membership_is_unique() {
        let mut room = Room::new("r".into());
        assert!(room.insert(member("a", Role::Participant)));
        assert!(!room.insert(member("a", Role::Teacher)));
        assert_eq!(room.len(), 1);
    }

    #[test]
    fn test_participants_keep_arrival_order_and_skip_observers() {
        let mut room = Room::new("r".into());
        room.insert(member("b", Role::Teacher));
        room.insert(member("z", Role::Observer));
        room.insert(member("a", Role::Participant));
        let ids: Vec<_> = room.participants().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert!(room.remove("z").is_some());
        assert!(room.remove("z").is_none());
    }
}
