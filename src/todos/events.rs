//! Push events and how they land in the local mirror

use log::{debug, warn};
use serde_json::Value;
use todo_sync_realtime::Invocation;

use super::types::{parse_timestamp, TodoItem};

pub const RECEIVE_TODO_UPDATE: &str = "ReceiveTodoUpdate";
pub const RECEIVE_TODO_DELETE: &str = "ReceiveTodoDelete";

/// A change pushed by the server for one row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TodoEvent {
    /// Created or changed; carries the full row
    Update(TodoItem),
    Delete(i64),
}

impl TodoEvent {
    /// Decode a hub invocation; `None` for other targets or malformed arguments
    pub fn from_invocation(invocation: &Invocation) -> Option<Self> {
        let args = &invocation.arguments;
        match invocation.target.as_str() {
            RECEIVE_TODO_UPDATE => match decode_update(args) {
                Some(item) => Some(Self::Update(item)),
                None => {
                    warn!("Malformed {} arguments: {:?}", RECEIVE_TODO_UPDATE, args);
                    None
                }
            },
            RECEIVE_TODO_DELETE => match args.first().and_then(Value::as_i64) {
                Some(id) => Some(Self::Delete(id)),
                None => {
                    warn!("Malformed {} arguments: {:?}", RECEIVE_TODO_DELETE, args);
                    None
                }
            },
            other => {
                debug!("Ignoring hub target {}", other);
                None
            }
        }
    }
}

// positional: id, title, description, createdAt, appUserId, isCompleted, completedAt
fn decode_update(args: &[Value]) -> Option<TodoItem> {
    let completed_at = match args.get(6) {
        None | Some(Value::Null) => None,
        Some(value) => Some(parse_timestamp(value.as_str()?)?),
    };
    Some(TodoItem {
        id: args.first()?.as_i64()?,
        title: args.get(1)?.as_str()?.to_string(),
        description: args.get(2)?.as_str().unwrap_or_default().to_string(),
        created_at: parse_timestamp(args.get(3)?.as_str()?)?,
        app_user_id: args.get(4)?.as_str()?.to_string(),
        is_completed: args.get(5)?.as_bool()?,
        completed_at,
    })
}

/// Fold one event into the mirror.
///
/// Update replaces the row with the same id or prepends a new one, delete
/// removes it if present. Applying the same event twice leaves one row.
pub fn apply_event(items: &mut Vec<TodoItem>, event: TodoEvent) {
    match event {
        TodoEvent::Update(item) => upsert(items, item),
        TodoEvent::Delete(id) => items.retain(|t| t.id != id),
    }
}

pub(crate) fn upsert(items: &mut Vec<TodoItem>, item: TodoItem) {
    match items.iter_mut().find(|t| t.id == item.id) {
        Some(existing) => *existing = item,
        None => items.insert(0, item),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn item(id: i64, title: &str) -> TodoItem {
        TodoItem {
            id,
            title: title.to_string(),
            description: String::new(),
            created_at: Utc::now(),
            app_user_id: "user-1".to_string(),
            is_completed: false,
            completed_at: None,
        }
    }

    #[test]
    fn test_update_is_idempotent() {
        let mut items = vec![item(1, "a")];
        apply_event(&mut items, TodoEvent::Update(item(2, "b")));
        apply_event(&mut items, TodoEvent::Update(item(2, "b")));

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, 2);
    }

    #[test]
    fn test_update_replaces_in_place() {
        let mut items = vec![item(1, "a"), item(2, "b"), item(3, "c")];
        apply_event(&mut items, TodoEvent::Update(item(2, "renamed")));

        let ids: Vec<i64> = items.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(items[1].title, "renamed");
    }

    #[test]
    fn test_delete_unknown_id_is_noop() {
        let mut items = vec![item(1, "a")];
        let before = items.clone();
        apply_event(&mut items, TodoEvent::Delete(99));
        assert_eq!(items, before);

        apply_event(&mut items, TodoEvent::Delete(1));
        assert!(items.is_empty());
    }

    #[test]
    fn test_decode_update_invocation() {
        let invocation = Invocation::new(
            RECEIVE_TODO_UPDATE,
            vec![
                json!(7),
                json!("Ship it"),
                json!("before friday"),
                json!("2024-05-01T10:00:00.5"),
                json!("user-1"),
                json!(true),
                json!("2024-05-02T08:30:00Z"),
            ],
        );
        match TodoEvent::from_invocation(&invocation) {
            Some(TodoEvent::Update(item)) => {
                assert_eq!(item.id, 7);
                assert_eq!(item.title, "Ship it");
                assert!(item.is_completed);
                assert!(item.completed_at.is_some());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_decode_delete_and_unknown() {
        let delete = Invocation::new(RECEIVE_TODO_DELETE, vec![json!(4)]);
        assert_eq!(TodoEvent::from_invocation(&delete), Some(TodoEvent::Delete(4)));

        let other = Invocation::new("ReceiveSomethingElse", vec![]);
        assert!(TodoEvent::from_invocation(&other).is_none());

        let short = Invocation::new(RECEIVE_TODO_UPDATE, vec![json!(1)]);
        assert!(TodoEvent::from_invocation(&short).is_none());
    }
}
