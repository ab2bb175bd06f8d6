//! Todo payloads exchanged with `/todoitems` and the hub

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// A row of the todo list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoItem {
    pub id: i64,
    pub title: String,
    pub description: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
    pub app_user_id: String,
    pub is_completed: bool,
    #[serde(default, deserialize_with = "deserialize_optional_timestamp")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TodoItem {
    /// Mark completed at `at`
    pub fn complete(&mut self, at: DateTime<Utc>) {
        self.is_completed = true;
        self.completed_at = Some(at);
    }
}

/// Body of `POST /todoitems`; the server assigns the id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTodoItem {
    pub title: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub app_user_id: String,
}

impl CreateTodoItem {
    /// New item owned by `app_user_id`, stamped now
    pub fn new(title: &str, description: &str, app_user_id: &str) -> Self {
        Self {
            title: title.to_string(),
            description: description.to_string(),
            created_at: Utc::now(),
            app_user_id: app_user_id.to_string(),
        }
    }
}

/// Parse an RFC 3339 timestamp; one without an offset is taken as UTC
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    parse_timestamp(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", value)))
}

fn deserialize_optional_timestamp<'de, D>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(value) => parse_timestamp(&value)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", value))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_parse_timestamp() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2024-05-01T10:00:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01T12:00:00+02:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01T10:00:00"), Some(expected));
        assert!(parse_timestamp("2024-05-01T10:00:00.1234567").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_deserialize_server_row() {
        let item: TodoItem = serde_json::from_value(json!({
            "id": 3,
            "title": "Write report",
            "description": "Q2 numbers",
            "createdAt": "2024-05-01T10:00:00.123",
            "appUserId": "user-1",
            "isCompleted": false,
            "completedAt": null
        }))
        .unwrap();

        assert_eq!(item.id, 3);
        assert!(!item.is_completed);
        assert!(item.completed_at.is_none());
    }

    #[test]
    fn test_serialize_camel_case() {
        let create = CreateTodoItem::new("Buy milk", "2 liters", "user-1");
        let value = serde_json::to_value(&create).unwrap();
        assert_eq!(value["appUserId"], "user-1");
        assert!(value.get("createdAt").is_some());
    }
}
