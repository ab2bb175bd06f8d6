//! REST calls for `/todoitems`

use log::debug;
use todo_sync_auth::{ApiClient, AuthError};

use super::types::{CreateTodoItem, TodoItem};

const TODO_ITEMS: &str = "/todoitems";

/// Thin typed wrapper over the todo endpoints
#[derive(Debug, Clone)]
pub struct TodoApi {
    api: ApiClient,
}

impl TodoApi {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    pub fn client(&self) -> &ApiClient {
        &self.api
    }

    pub async fn get_all(&self) -> Result<Vec<TodoItem>, AuthError> {
        self.api.get(TODO_ITEMS).send_json().await
    }

    /// The created row arrives through the push channel, not the response
    pub async fn create(&self, item: &CreateTodoItem) -> Result<(), AuthError> {
        debug!("Creating todo item {:?}", item.title);
        self.api.post(TODO_ITEMS).json(item)?.send_empty().await
    }

    pub async fn get(&self, id: i64) -> Result<TodoItem, AuthError> {
        self.api.get(&item_path(id)).send_json().await
    }

    /// Full replacement of the row
    pub async fn update(&self, item: &TodoItem) -> Result<(), AuthError> {
        self.api.put(&item_path(item.id)).json(item)?.send_empty().await
    }

    pub async fn delete(&self, id: i64) -> Result<(), AuthError> {
        self.api.delete(&item_path(id)).send_empty().await
    }

    /// Body is a bare JSON array of ids
    pub async fn bulk_complete(&self, ids: &[i64]) -> Result<(), AuthError> {
        self.api
            .post(&format!("{}/bulk-complete", TODO_ITEMS))
            .json(&ids)?
            .send_empty()
            .await
    }
}

fn item_path(id: i64) -> String {
    format!("{}/{}", TODO_ITEMS, id)
}
