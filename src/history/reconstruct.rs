//! Turning stored turns plus a new user message into what the engine needs.

use crate::models::chat::{ Role, Turn };

#[derive(Clone, Debug, PartialEq)]
pub struct Reconstruction {
    /// Turns to persist once the answer is known; always ends with the new
    /// user message.
    pub trimmed: Vec<Turn>,
    /// Completed (user, assistant) exchanges inside the window, oldest first.
    pub paired: Vec<(String, String)>,
}

/// Windows the session to its last `memory_window` turns (counting the new
/// message), then pairs it up.
///
/// `stored` is `None` both for a fresh session and for a key the store no
/// longer knows; both start over from the new message alone.
pub fn reconstruct(stored: Option<Vec<Turn>>, new_user_text: &str, memory_window: usize) -> Reconstruction {
    let mut turns = stored.unwrap_or_default();
    turns.push(Turn::user(new_user_text));

    let window = memory_window.max(1);
    if turns.len() > window {
        turns.drain(..turns.len() - window);
    }

    let paired = pair_turns(&turns);
    Reconstruction { trimmed: turns, paired }
}

/// Collects well-formed user→assistant exchanges. A user turn is buffered only
/// when nothing is pending; an assistant turn completes a pending user turn;
/// every other turn is skipped. A trailing unanswered user turn is dropped.
pub fn pair_turns(turns: &[Turn]) -> Vec<(String, String)> {
    let mut paired = Vec::new();
    let mut pending: Option<&str> = None;

    for turn in turns {
        match (&turn.role, pending) {
            (Role::User, None) => {
                pending = Some(turn.content.as_str());
            }
            (Role::Assistant, Some(user_text)) => {
                paired.push((user_text.to_string(), turn.content.clone()));
                pending = None;
            }
            _ => {}
        }
    }

    paired
}
