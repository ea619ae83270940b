//! Pass-through game actions.

use netsync_shared::net::ClientMsg;

/// Actions the game forwards to the server untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum GameAction {
    Shoot(serde_json::Value),
    CaptureFlag(serde_json::Value),
    ScoreFlag(serde_json::Value),
    /// Chat line, stamped with the current UTC time in milliseconds.
    Chat(String),
}

impl GameAction {
    pub fn into_message(self) -> ClientMsg {
        match self {
            GameAction::Shoot(v) => ClientMsg::Shoot(v),
            GameAction::CaptureFlag(v) => ClientMsg::CaptureFlag(v),
            GameAction::ScoreFlag(v) => ClientMsg::ScoreFlag(v),
            GameAction::Chat(text) => ClientMsg::Message {
                text,
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_is_timestamped() {
        let before = chrono::Utc::now().timestamp_millis();
        let ClientMsg::Message { text, timestamp } = GameAction::Chat("gg".into()).into_message()
        else {
            panic!("expected message");
        };
        assert_eq!(text, "gg");
        assert!(timestamp >= before);
    }

    #[test]
    fn payload_actions_pass_through() {
        let payload = serde_json::json!({"direction": [0, 0, 1]});
        assert_eq!(
            GameAction::Shoot(payload.clone()).into_message(),
            ClientMsg::Shoot(payload)
        );
    }
}
