use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Message;

/// Direct conversation between exactly two participants. The pair is
/// normalized so that `participant_a < participant_b`, which is what makes a
/// pair unique regardless of who messaged first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub participant_a: Uuid,
    pub participant_b: Uuid,
    pub created_at: DateTime<Utc>,
    /// Bumped on every new message.
    pub updated_at: DateTime<Utc>,
    /// Denormalized most-recent message for cheap listing.
    pub last_message: Option<Message>,
    pub unread_a: i64,
    pub unread_b: i64,
}

impl Conversation {
    /// Canonical ordering of a participant pair.
    pub fn normalize_pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    pub fn participants(&self) -> [Uuid; 2] {
        [self.participant_a, self.participant_b]
    }

    pub fn is_participant(&self, user_id: Uuid) -> bool {
        user_id == self.participant_a || user_id == self.participant_b
    }

    /// The other participant, if `user_id` is one of the pair.
    pub fn peer_of(&self, user_id: Uuid) -> Option<Uuid> {
        if user_id == self.participant_a {
            Some(self.participant_b)
        } else if user_id == self.participant_b {
            Some(self.participant_a)
        } else {
            None
        }
    }

    pub fn unread_for(&self, user_id: Uuid) -> i64 {
        if user_id == self.participant_a {
            self.unread_a
        } else if user_id == self.participant_b {
            self.unread_b
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_normalization_is_order_independent() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(
            Conversation::normalize_pair(a, b),
            Conversation::normalize_pair(b, a)
        );
    }

    #[test]
    fn peer_of_returns_the_other_participant() {
        let (a, b) = Conversation::normalize_pair(Uuid::new_v4(), Uuid::new_v4());
        let conv = Conversation {
            id: Uuid::new_v4(),
            participant_a: a,
            participant_b: b,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_message: None,
            unread_a: 0,
            unread_b: 0,
        };
        assert_eq!(conv.peer_of(a), Some(b));
        assert_eq!(conv.peer_of(b), Some(a));
        assert_eq!(conv.peer_of(Uuid::new_v4()), None);
    }
}
