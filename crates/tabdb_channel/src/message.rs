//! Internal election signals.

use serde::{Deserialize, Serialize};

const LEADER_CONTEXT: &str = "leader";
const DEATH_ACTION: &str = "death";

/// A signal posted on the internal side of a channel.
///
/// The only signal in use is leader death:
/// `{"context": "leader", "action": "death", "token": "..."}`. The token
/// identifies one death so receivers can tell whether their elector has
/// already reacted to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalMessage {
    /// Subsystem the signal belongs to.
    pub context: String,
    /// What happened.
    pub action: String,
    /// Unique id of this signal.
    #[serde(default)]
    pub token: String,
}

impl InternalMessage {
    /// Creates a leader death signal.
    pub fn leader_death(token: impl Into<String>) -> Self {
        Self {
            context: LEADER_CONTEXT.into(),
            action: DEATH_ACTION.into(),
            token: token.into(),
        }
    }

    /// Returns true if this is a leader death signal.
    pub fn is_leader_death(&self) -> bool {
        self.context == LEADER_CONTEXT && self.action == DEATH_ACTION
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn death_wire_shape() {
        let msg = InternalMessage::leader_death("t1");
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"context": "leader", "action": "death", "token": "t1"})
        );
        assert!(msg.is_leader_death());
    }

    #[test]
    fn token_is_optional_on_the_wire() {
        let msg: InternalMessage =
            serde_json::from_value(json!({"context": "leader", "action": "death"})).unwrap();
        assert!(msg.is_leader_death());
        assert!(msg.token.is_empty());

        let other: InternalMessage =
            serde_json::from_value(json!({"context": "leader", "action": "apply"})).unwrap();
        assert!(!other.is_leader_death());
    }
}
