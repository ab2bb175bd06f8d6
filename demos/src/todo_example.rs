use dotenvy::dotenv;
use log::info;
use std::env;
use std::time::Duration;
use todo_sync::prelude::*;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    pretty_env_logger::init();

    let email = env::var("TODO_EMAIL").expect("TODO_EMAIL must be set");
    let password = env::var("TODO_PASSWORD").expect("TODO_PASSWORD must be set");

    let client = TodoClient::from_env()?;

    // print notices the way a UI would toast them
    let mut notices = client.notices();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            println!("[notice] {}", notice);
        }
    });

    let session = match client.restore().await? {
        Some(session) => {
            println!("Restored session for {}", session.email);
            session
        }
        None => {
            let session = client.login(&email, &password).await?;
            println!("Logged in as {}", session.email);
            session
        }
    };

    let todos = client.todos();
    println!("\n1. Current list ({} items)", todos.len());
    for item in todos.items() {
        let mark = if item.is_completed { "x" } else { " " };
        println!("  [{}] {} {}", mark, item.id, item.title);
    }

    println!("\n2. Creating an item; it shows up once the hub pushes it");
    let before = todos.len();
    todos
        .create(&CreateTodoItem::new("Try todo-sync", "created by the demo", &session.id))
        .await?;
    for _ in 0..50 {
        if todos.len() > before {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    match todos.items().first() {
        Some(item) if todos.len() > before => println!("  pushed: {} {}", item.id, item.title),
        _ => println!("  no push received yet"),
    }

    println!("\n3. Completing every open item");
    let open: Vec<i64> = todos
        .items()
        .iter()
        .filter(|t| !t.is_completed)
        .map(|t| t.id)
        .collect();
    if !open.is_empty() {
        todos.bulk_complete(&open).await?;
    }
    println!("  completed {} item(s)", open.len());

    println!("\n4. Watching for changes from other sessions for 30 seconds");
    tokio::time::sleep(Duration::from_secs(30)).await;
    println!("  list now has {} item(s)", todos.len());

    client.logout().await;
    info!("Demo finished");
    Ok(())
}
