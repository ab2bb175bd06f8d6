//! The todo list: wire types, push events, REST calls and the local mirror

pub mod api;
pub mod events;
pub mod store;
pub mod types;

pub use api::TodoApi;
pub use events::{apply_event, TodoEvent, RECEIVE_TODO_DELETE, RECEIVE_TODO_UPDATE};
pub use store::TodoStore;
pub use types::{parse_timestamp, CreateTodoItem, TodoItem};
