//! Conversation assembly: persona prompt, client history, current user turn.

use crate::error::RelayFailure;
use crate::models::{ChatTurn, HistoryEntry, Role};

/// Instruction block injected as the first (system) turn of every conversation.
pub const PERSONA_PROMPT: &str = "You are a supportive AI therapy assistant. While you're not a replacement for a licensed therapist:
- Respond with empathy and understanding
- Help users explore their thoughts and feelings
- Encourage positive coping strategies
- NEVER give medical advice
- If someone is in crisis, direct them to emergency services
- Maintain a professional, caring tone
- Keep responses concise but meaningful";

/// Parse a client-supplied role. Only `user` and `assistant` are accepted;
/// the system slot is reserved for the persona.
fn history_role(raw: &str) -> Option<Role> {
    match raw {
        "user" => Some(Role::User),
        "assistant" => Some(Role::Assistant),
        _ => None,
    }
}

/// Build `[persona] ++ history ++ [user(message)]`.
///
/// History order is kept verbatim. The message is sent as given; trimming is
/// only used to decide whether it is empty.
pub fn assemble(message: &str, history: &[HistoryEntry]) -> Result<Vec<ChatTurn>, RelayFailure> {
    if message.trim().is_empty() {
        return Err(RelayFailure::EmptyMessage);
    }

    let mut turns = Vec::with_capacity(history.len() + 2);
    turns.push(ChatTurn::system(PERSONA_PROMPT));
    for (index, entry) in history.iter().enumerate() {
        let role = history_role(&entry.role).ok_or_else(|| RelayFailure::InvalidHistory {
            index,
            role: entry.role.clone(),
        })?;
        turns.push(ChatTurn::new(role, entry.content.clone()));
    }
    turns.push(ChatTurn::user(message));
    Ok(turns)
}
