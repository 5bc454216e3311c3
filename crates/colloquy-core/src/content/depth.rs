use crate::models::{Message, Role};

/// Number of turns between the turn holding `message_id` and the latest one.
///
/// Every user message opens a new turn; all following non-user messages
/// (any number of speakers, system notes included) belong to it. Messages
/// ahead of the first user message form turn 0. An id that is not in the
/// history is treated as part of the latest turn.
pub fn turn_depth(history: &[Message], message_id: &str) -> usize {
    let mut turn = 0usize;
    let mut seen_any = false;
    let mut target = None;
    for message in history {
        if message.role == Role::User && seen_any {
            turn += 1;
        }
        seen_any = true;
        if message.id == message_id {
            target = Some(turn);
        }
    }
    target.map(|t| turn - t).unwrap_or(0)
}
