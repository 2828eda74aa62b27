use crate::state::ChatMessage;

/// Canonical room key for a negotiation between two parties.
///
/// The farmer id always comes first. The key is deliberately not
/// order-normalized: both clients must derive the identical string from their
/// own perspective, so every call site routes through
/// `AppCore::room_with`, which knows which side this client is. A sorted key
/// would silently mask a caller passing arguments in the wrong order.
pub(crate) fn room_key(farmer_id: &str, buyer_id: &str) -> String {
    format!("negotiation:{farmer_id}:{buyer_id}")
}

/// Identity rule for chat events that may arrive via several paths (optimistic
/// insert, broadcast echo, store history). Two copies are the same event when
/// either both carry a persisted id and the ids match, or the
/// (time label, text, sender) triple matches.
pub(crate) fn same_logical_message(a: &ChatMessage, b: &ChatMessage) -> bool {
    if let (Some(x), Some(y)) = (&a.persisted_id, &b.persisted_id) {
        if x == y {
            return true;
        }
    }
    a.time_label == b.time_label && a.text == b.text && a.sender_id == b.sender_id
}

/// Merge one incoming copy into the rendered list, at most once.
///
/// Returns true when the list changed: either the copy was new and got
/// appended, or an existing entry adopted the persisted id its echo carried.
pub(crate) fn apply_incoming(messages: &mut Vec<ChatMessage>, incoming: ChatMessage) -> bool {
    for existing in messages.iter_mut() {
        if same_logical_message(existing, &incoming) {
            if existing.persisted_id.is_none() && incoming.persisted_id.is_some() {
                existing.persisted_id = incoming.persisted_id;
                return true;
            }
            return false;
        }
    }
    messages.push(incoming);
    true
}
