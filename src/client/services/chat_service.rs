use crate::client::services::protocol;
use crate::common::error::{ChatError, ChatResult};
use crate::common::models::{ConversationEntry, MessageRecord, NotificationRecord, UserProfile};
use log::warn;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

/// Line protocol client. A background task owns the TCP connection and
/// processes commands sequentially; it transparently reconnects and resends
/// the current command if the server drops the connection.
#[derive(Default)]
pub struct ChatService {
    /// Sender used to hand a command to the background task and wait for
    /// the single-line response.
    tx: Option<mpsc::UnboundedSender<(String, oneshot::Sender<String>)>>,
    /// Keep the background task handle so it stays alive for the lifetime
    /// of the service.
    _bg: Option<tokio::task::JoinHandle<()>>,
}

impl ChatService {
    pub fn new() -> Self {
        Self { tx: None, _bg: None }
    }

    /// Drop the connection and background task; the next command reconnects.
    pub fn reset(&mut self) {
        self.tx = None;
        self._bg = None;
    }

    /// Ensure there is an active background task connected to `host`.
    async fn ensure_connected(&mut self, host: &str) -> anyhow::Result<()> {
        if self.tx.is_some() {
            return Ok(());
        }

        let host = host.to_string();
        let stream = TcpStream::connect(&host).await?;
        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);

        let (tx, mut rx) = mpsc::unbounded_channel::<(String, oneshot::Sender<String>)>();

        let handle = tokio::spawn(async move {
            let mut server_line = String::new();
            while let Some((cmd, resp_tx)) = rx.recv().await {
                // Send the command and read one response line, reconnecting
                // and resending on failure until we get a reply or give up.
                loop {
                    let wrote = async {
                        writer.write_all(cmd.as_bytes()).await?;
                        writer.write_all(b"\n").await?;
                        writer.flush().await
                    }
                    .await;
                    if let Err(e) = wrote {
                        warn!("[CLIENT:SVC] write failed: {}, reconnecting...", e);
                        match TcpStream::connect(&host).await {
                            Ok(s) => {
                                let (r, w) = s.into_split();
                                reader = BufReader::new(r);
                                writer = BufWriter::new(w);
                                continue;
                            }
                            Err(e) => {
                                let _ = resp_tx.send(format!("ERR: Transient: reconnect failed: {}", e));
                                break;
                            }
                        }
                    }

                    server_line.clear();
                    match reader.read_line(&mut server_line).await {
                        Ok(0) => {
                            warn!("[CLIENT:SVC] server closed connection, reconnecting...");
                            match TcpStream::connect(&host).await {
                                Ok(s) => {
                                    let (r, w) = s.into_split();
                                    reader = BufReader::new(r);
                                    writer = BufWriter::new(w);
                                    continue;
                                }
                                Err(e) => {
                                    let _ = resp_tx.send(format!("ERR: Transient: reconnect failed: {}", e));
                                    break;
                                }
                            }
                        }
                        Ok(_) => {
                            let _ = resp_tx.send(server_line.trim().to_string());
                            break;
                        }
                        Err(e) => {
                            warn!("[CLIENT:SVC] read failed: {}, reconnecting...", e);
                            match TcpStream::connect(&host).await {
                                Ok(s) => {
                                    let (r, w) = s.into_split();
                                    reader = BufReader::new(r);
                                    writer = BufWriter::new(w);
                                    continue;
                                }
                                Err(e) => {
                                    let _ = resp_tx.send(format!("ERR: Transient: reconnect failed: {}", e));
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        });

        self.tx = Some(tx);
        self._bg = Some(handle);
        Ok(())
    }

    /// Send a raw command line and wait for the raw response line.
    pub async fn send_command(&mut self, host: &str, cmd: String) -> anyhow::Result<String> {
        self.ensure_connected(host).await?;
        if let Some(tx) = &self.tx {
            let (resp_tx, resp_rx) = oneshot::channel();
            tx.send((cmd, resp_tx))
                .map_err(|_| anyhow::anyhow!("send failed: background task ended"))?;
            let resp = resp_rx
                .await
                .map_err(|_| anyhow::anyhow!("response channel closed before response"))?;
            Ok(resp)
        } else {
            Err(anyhow::anyhow!("not connected"))
        }
    }

    async fn request(&mut self, host: &str, cmd: String) -> ChatResult<String> {
        let resp = self
            .send_command(host, cmd)
            .await
            .map_err(|e| ChatError::Transient(e.to_string()))?;
        protocol::parse_reply(&resp)
    }

    // Typed wrappers over the wire surface.

    pub async fn register(
        &mut self,
        host: &str,
        username: &str,
        avatar_url: Option<&str>,
    ) -> ChatResult<UserProfile> {
        let cmd = match avatar_url {
            Some(url) => format!("/register {} {}", username, url),
            None => format!("/register {}", username),
        };
        let payload = self.request(host, cmd).await?;
        protocol::decode(&payload)
    }

    pub async fn get_profile(&mut self, host: &str, user_id: &str) -> ChatResult<UserProfile> {
        let payload = self.request(host, format!("/get_profile {}", user_id)).await?;
        protocol::decode(&payload)
    }

    pub async fn list_users(&mut self, host: &str, viewer_id: &str) -> ChatResult<Vec<UserProfile>> {
        let payload = self.request(host, format!("/list_users {}", viewer_id)).await?;
        protocol::decode(&payload)
    }

    pub async fn ping(&mut self, host: &str, user_id: &str) -> ChatResult<()> {
        self.request(host, format!("/ping {}", user_id)).await?;
        Ok(())
    }

    pub async fn go_offline(&mut self, host: &str, user_id: &str) -> ChatResult<()> {
        self.request(host, format!("/go_offline {}", user_id)).await?;
        Ok(())
    }

    pub async fn get_or_create_conversation(
        &mut self,
        host: &str,
        user_a: &str,
        user_b: &str,
    ) -> ChatResult<String> {
        self.request(host, format!("/get_or_create_conversation {} {}", user_a, user_b))
            .await
    }

    pub async fn get_conversations(
        &mut self,
        host: &str,
        user_id: &str,
    ) -> ChatResult<Vec<ConversationEntry>> {
        let payload = self
            .request(host, format!("/get_conversations {}", user_id))
            .await?;
        protocol::decode(&payload)
    }

    pub async fn get_messages(
        &mut self,
        host: &str,
        conversation_id: &str,
        viewer_id: &str,
    ) -> ChatResult<Vec<MessageRecord>> {
        let payload = self
            .request(host, format!("/get_messages {} {}", conversation_id, viewer_id))
            .await?;
        protocol::decode(&payload)
    }

    pub async fn send_message(
        &mut self,
        host: &str,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
    ) -> ChatResult<MessageRecord> {
        let payload = self
            .request(
                host,
                format!("/send_message {} {} {}", conversation_id, sender_id, content),
            )
            .await?;
        protocol::decode(&payload)
    }

    pub async fn mark_seen(
        &mut self,
        host: &str,
        conversation_id: &str,
        viewer_id: &str,
    ) -> ChatResult<u64> {
        let payload = self
            .request(host, format!("/mark_seen {} {}", conversation_id, viewer_id))
            .await?;
        payload
            .parse()
            .map_err(|_| ChatError::Transient(format!("malformed mark_seen reply: {}", payload)))
    }

    pub async fn set_typing(
        &mut self,
        host: &str,
        conversation_id: &str,
        user_id: &str,
        is_typing: bool,
    ) -> ChatResult<()> {
        self.request(
            host,
            format!("/set_typing {} {} {}", conversation_id, user_id, is_typing),
        )
        .await?;
        Ok(())
    }

    pub async fn get_notifications(
        &mut self,
        host: &str,
        user_id: &str,
    ) -> ChatResult<Vec<NotificationRecord>> {
        let payload = self
            .request(host, format!("/get_notifications {}", user_id))
            .await?;
        protocol::decode(&payload)
    }
}
