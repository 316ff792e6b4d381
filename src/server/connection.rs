use crate::common::error::ChatError;
use crate::server::config::ServerConfig;
use crate::server::database::Database;
use crate::server::{conversations, messages, notifications, typing, users};
use log::{debug, error, info};
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};

pub struct Server {
    pub db: Arc<Database>,
    pub config: ServerConfig,
}

fn ok_json<T: Serialize>(value: &T) -> String {
    match serde_json::to_string(value) {
        Ok(json) => format!("OK: {}", json),
        Err(e) => format!("ERR: Transient: encoding failed: {}", e),
    }
}

fn err_reply(e: &ChatError) -> String {
    format!("ERR: {}: {}", e.code(), e)
}

impl Server {
    pub async fn run(self, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("[SERVER] Listening on {}", addr);
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener (lets callers bind to an
    /// ephemeral port first and read the address back).
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let server = Arc::new(self);
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("[SERVER] New connection from {}", peer);
            let server = server.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_client(stream).await {
                    error!("[SERVER] Client error ({}): {}", peer, e);
                }
            });
        }
    }

    async fn handle_client(&self, stream: TcpStream) -> anyhow::Result<()> {
        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);
        let mut line = String::new();

        loop {
            line.clear();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                break;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let mut parts = trimmed.split_whitespace();
            let cmd = parts.next().unwrap_or("");
            let args: Vec<&str> = parts.collect();

            if cmd == "/quit" {
                writer.write_all(b"OK: bye\n").await?;
                writer.flush().await?;
                break;
            }

            let resp = self.handle_command(cmd, &args).await;
            writer.write_all(resp.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
        Ok(())
    }

    pub async fn handle_command(&self, cmd: &str, args: &[&str]) -> String {
        debug!("[SERVER] Received command: {} ({} args)", cmd, args.len());
        match cmd {
            // IDENTITY & PRESENCE
            "/register" if !args.is_empty() => {
                let username = args[0];
                let avatar = args.get(1).copied();
                match users::register(self.db.clone(), username, avatar).await {
                    Ok(profile) => ok_json(&profile),
                    Err(e) => err_reply(&e),
                }
            }
            "/get_profile" if args.len() == 1 => {
                match users::get_profile(self.db.clone(), args[0]).await {
                    Ok(profile) => ok_json(&profile),
                    Err(e) => err_reply(&e),
                }
            }
            "/list_users" if args.len() == 1 => {
                match users::list_all(self.db.clone(), args[0]).await {
                    Ok(list) => ok_json(&list),
                    Err(e) => err_reply(&e),
                }
            }
            "/list_online" if args.len() == 1 => {
                match users::list_online(self.db.clone(), args[0]).await {
                    Ok(list) => ok_json(&list),
                    Err(e) => err_reply(&e),
                }
            }
            "/ping" if args.len() == 1 => {
                match users::ping_presence(self.db.clone(), args[0]).await {
                    Ok(()) => "OK: pong".to_string(),
                    Err(e) => err_reply(&e),
                }
            }
            "/go_offline" if args.len() == 1 => {
                match users::set_offline(self.db.clone(), args[0]).await {
                    Ok(()) => "OK: offline".to_string(),
                    Err(e) => err_reply(&e),
                }
            }

            // CONVERSATIONS
            "/get_or_create_conversation" if args.len() == 2 => {
                match conversations::get_or_create(self.db.clone(), args[0], args[1]).await {
                    Ok(id) => format!("OK: {}", id),
                    Err(e) => err_reply(&e),
                }
            }
            "/get_conversations" if args.len() == 1 => {
                match conversations::list_for_user(self.db.clone(), args[0]).await {
                    Ok(entries) => ok_json(&entries),
                    Err(e) => err_reply(&e),
                }
            }

            // MESSAGES
            "/get_messages" if args.len() == 2 => {
                match messages::list_for(self.db.clone(), args[0], args[1]).await {
                    Ok(list) => ok_json(&list),
                    Err(e) => err_reply(&e),
                }
            }
            "/send_message" if args.len() >= 3 => {
                let conversation_id = args[0];
                let sender_id = args[1];
                let content = args[2..].join(" ");
                match messages::append(
                    self.db.clone(),
                    conversation_id,
                    sender_id,
                    &content,
                    &self.config,
                )
                .await
                {
                    Ok(record) => ok_json(&record),
                    Err(e) => err_reply(&e),
                }
            }
            "/mark_seen" if args.len() == 2 => {
                match messages::mark_seen(self.db.clone(), args[0], args[1]).await {
                    Ok(n) => format!("OK: {}", n),
                    Err(e) => err_reply(&e),
                }
            }

            // TYPING
            "/set_typing" if args.len() == 3 => {
                let is_typing = matches!(args[2], "true" | "1");
                match typing::set_typing(self.db.clone(), args[0], args[1], is_typing).await {
                    Ok(()) => "OK: typing updated".to_string(),
                    Err(e) => err_reply(&e),
                }
            }

            // NOTIFICATIONS
            "/get_notifications" if args.len() == 1 => {
                match notifications::list_unread(self.db.clone(), args[0]).await {
                    Ok(list) => ok_json(&list),
                    Err(e) => err_reply(&e),
                }
            }
            "/read_notifications" if args.len() == 1 => {
                match notifications::mark_all_read(self.db.clone(), args[0]).await {
                    Ok(n) => format!("OK: {}", n),
                    Err(e) => err_reply(&e),
                }
            }

            "/help" => help_text(),
            _ => "ERR: Validation: unknown command or wrong arguments (try /help)".to_string(),
        }
    }
}

fn help_text() -> String {
    "OK: Commands:\n\
    /register <username> [avatar_url]\n\
    /get_profile <user_id>\n\
    /list_users <user_id>\n\
    /list_online <user_id>\n\
    /ping <user_id>\n\
    /go_offline <user_id>\n\
    /get_or_create_conversation <user_id_a> <user_id_b>\n\
    /get_conversations <user_id>\n\
    /get_messages <conversation_id> <viewer_id>\n\
    /send_message <conversation_id> <sender_id> <content>\n\
    /mark_seen <conversation_id> <viewer_id>\n\
    /set_typing <conversation_id> <user_id> <true|false>\n\
    /get_notifications <user_id>\n\
    /read_notifications <user_id>\n\
    /quit"
        .to_string()
}
