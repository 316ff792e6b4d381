// Interactive messaging client for the agora platform.
use agora::client::core::MessagingCore;
use agora::client::services::chat_service::ChatService;
use agora::common::models::ConversationEntry;
use agora::server::config::ClientConfig;
use std::sync::Arc;
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;

fn print_entries(entries: &[ConversationEntry]) {
    if entries.is_empty() {
        println!("[CLIENT] No conversations yet.");
        return;
    }
    for (i, e) in entries.iter().enumerate() {
        let presence = if e.partner.is_online { "online" } else { "offline" };
        let preview = e
            .last_message
            .as_ref()
            .map(|m| m.content.clone())
            .unwrap_or_else(|| "(no messages yet)".to_string());
        let typing = if e.partner_typing { " [typing...]" } else { "" };
        println!(
            "  {}. {} ({}) unread={} - {}{}",
            i + 1,
            e.partner.username,
            presence,
            e.unread_count,
            preview,
            typing
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "warn".to_string());
    std::env::set_var("RUST_LOG", &log_level);
    env_logger::init();

    let cfg = ClientConfig::from_env();
    let host = cfg.host();
    println!("[CLIENT] Connecting to {}", host);
    println!("[CLIENT] Commands: /register <username>, /login <user_id> [conversation_id],");
    println!("         /users, /chats, /open <n>, /start <n>, /close, /read,");
    println!("         /notifications, /quit. Any other text is sent as a message.");

    let mut input = BufReader::new(stdin());
    let mut line = String::new();

    // Pre-session service for registration and user listing; the core owns
    // its own connection once a session starts.
    let lobby = Arc::new(Mutex::new(ChatService::new()));
    let mut core: Option<MessagingCore> = None;
    let mut user_id: Option<String> = None;
    let mut known_users: Vec<String> = Vec::new();

    loop {
        line.clear();
        {
            use std::io::Write;
            print!("> ");
            let _ = std::io::stdout().flush();
        }
        let n = input.read_line(&mut line).await?;
        if n == 0 {
            break;
        }
        let cmd = line.trim();
        if cmd.is_empty() {
            continue;
        }
        let mut parts = cmd.split_whitespace();
        let command = parts.next().unwrap_or("");
        let args: Vec<&str> = parts.collect();

        match command {
            "/register" if args.len() == 1 => {
                let mut svc = lobby.lock().await;
                match svc.register(&host, args[0], None).await {
                    Ok(profile) => {
                        println!("[CLIENT] Registered. Your user id: {}", profile.id);
                    }
                    Err(e) => println!("[CLIENT] Registration failed: {}", e),
                }
            }
            "/login" if !args.is_empty() => {
                if let Some(c) = core.as_mut() {
                    c.shutdown().await;
                }
                let uid = args[0].to_string();
                let deep_link = args.get(1).copied();
                let mut c = MessagingCore::new(&host, &uid, cfg.poll_interval_ms);
                match c.start(deep_link).await {
                    Ok(()) => {
                        println!("[CLIENT] Session started for {}", uid);
                        print_entries(&c.conversations().await);
                        user_id = Some(uid);
                        core = Some(c);
                    }
                    Err(e) => println!("[CLIENT] Session start failed: {}", e),
                }
            }
            "/users" => {
                let viewer = user_id.clone().unwrap_or_default();
                if viewer.is_empty() {
                    println!("[CLIENT] Log in first.");
                    continue;
                }
                let mut svc = lobby.lock().await;
                match svc.list_users(&host, &viewer).await {
                    Ok(users) => {
                        known_users = users.iter().map(|u| u.id.clone()).collect();
                        for (i, u) in users.iter().enumerate() {
                            let presence = if u.is_online { "online" } else { "offline" };
                            println!("  {}. {} ({}) - {}", i + 1, u.username, presence, u.id);
                        }
                    }
                    Err(e) => println!("[CLIENT] User list failed: {}", e),
                }
            }
            "/chats" => match core.as_ref() {
                Some(c) => print_entries(&c.conversations().await),
                None => println!("[CLIENT] Log in first."),
            },
            "/open" if args.len() == 1 => {
                let Some(c) = core.as_mut() else {
                    println!("[CLIENT] Log in first.");
                    continue;
                };
                let entries = c.conversations().await;
                let target = match args[0].parse::<usize>() {
                    Ok(n) if n >= 1 && n <= entries.len() => {
                        entries[n - 1].conversation_id.clone()
                    }
                    _ => args[0].to_string(),
                };
                match c.open_conversation(&target).await {
                    Ok(()) => {
                        println!("[CLIENT] Opened {}", target);
                        print_transcript(c).await;
                    }
                    Err(e) => println!("[CLIENT] Open failed: {}", e),
                }
            }
            "/start" if args.len() == 1 => {
                let Some(c) = core.as_mut() else {
                    println!("[CLIENT] Log in first.");
                    continue;
                };
                let uid = user_id.clone().unwrap_or_default();
                let partner = match args[0].parse::<usize>() {
                    Ok(n) if n >= 1 && n <= known_users.len() => known_users[n - 1].clone(),
                    _ => args[0].to_string(),
                };
                let created = {
                    let svc = c.service();
                    let mut svc = svc.lock().await;
                    svc.get_or_create_conversation(&host, &uid, &partner).await
                };
                match created {
                    Ok(conv) => {
                        if let Err(e) = c.refresh_conversations().await {
                            println!("[CLIENT] List refresh failed: {}", e);
                        }
                        match c.open_conversation(&conv).await {
                            Ok(()) => println!("[CLIENT] Conversation {} ready", conv),
                            Err(e) => println!("[CLIENT] Open failed: {}", e),
                        }
                    }
                    Err(e) => println!("[CLIENT] Could not start conversation: {}", e),
                }
            }
            "/close" => {
                if let Some(c) = core.as_mut() {
                    c.close_conversation().await;
                    println!("[CLIENT] Conversation closed.");
                }
            }
            "/read" => match core.as_ref() {
                Some(c) => print_transcript(c).await,
                None => println!("[CLIENT] Log in first."),
            },
            "/notifications" => {
                let Some(c) = core.as_ref() else {
                    println!("[CLIENT] Log in first.");
                    continue;
                };
                let uid = user_id.clone().unwrap_or_default();
                let svc = c.service();
                let mut svc = svc.lock().await;
                match svc.get_notifications(&host, &uid).await {
                    Ok(list) => {
                        for n in list {
                            println!("  [{}] {} -> {}", n.created_at, n.kind, n.link);
                        }
                    }
                    Err(e) => println!("[CLIENT] Notifications failed: {}", e),
                }
            }
            "/quit" => {
                if let Some(c) = core.as_mut() {
                    c.shutdown().await;
                }
                break;
            }
            _ if command.starts_with('/') => {
                println!("[CLIENT] Unknown command: {}", command);
            }
            // Plain text: compose and send into the active conversation.
            _ => {
                let Some(c) = core.as_ref() else {
                    println!("[CLIENT] Log in first.");
                    continue;
                };
                c.compose_changed().await;
                match c.send(cmd).await {
                    Ok(_) => print_transcript(c).await,
                    Err(e) => println!("[CLIENT] Send failed: {}", e),
                }
            }
        }
    }
    Ok(())
}

async fn print_transcript(core: &MessagingCore) {
    if core.active_conversation().await.is_none() {
        println!("[CLIENT] No conversation open.");
        return;
    }
    for row in core.transcript().await {
        let marker = if row.failed {
            " [failed]"
        } else if row.pending {
            " [sending...]"
        } else if row.is_seen {
            " [seen]"
        } else {
            ""
        };
        println!("  [{}] {}: {}{}", row.created_at, row.sender_id, row.content, marker);
    }
    if core.partner_typing().await {
        println!("  ... partner is typing");
    }
}
