// End-to-end smoke run against a live agora-server instance.
use agora::client::services::chat_service::ChatService;
use agora::server::config::ClientConfig;
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = ClientConfig::from_env();
    let host = cfg.host();
    println!("Using host {}", host);

    let mut svc = ChatService::new();

    // Fresh usernames per run so the scenario can be repeated.
    let run_id = Uuid::new_v4().to_string();
    let suffix = &run_id[..8];
    let alice = svc
        .register(&host, &format!("alice-{}", suffix), None)
        .await?;
    let bob = svc.register(&host, &format!("bob-{}", suffix), None).await?;
    println!("REGISTER -> {} / {}", alice.id, bob.id);

    let conv = svc
        .get_or_create_conversation(&host, &alice.id, &bob.id)
        .await?;
    let conv_again = svc
        .get_or_create_conversation(&host, &bob.id, &alice.id)
        .await?;
    println!("CONVERSATION -> {} (reversed lookup: {})", conv, conv_again);
    assert_eq!(conv, conv_again);

    let sent = svc.send_message(&host, &conv, &alice.id, "Bonjour").await?;
    println!("SEND -> id={} seen={}", sent.id, sent.is_seen);

    let entries = svc.get_conversations(&host, &bob.id).await?;
    println!(
        "BOB LIST -> {} conversation(s), unread={}",
        entries.len(),
        entries[0].unread_count
    );

    let marked = svc.mark_seen(&host, &conv, &bob.id).await?;
    println!("MARK SEEN -> {} message(s)", marked);

    let entries = svc.get_conversations(&host, &bob.id).await?;
    println!("BOB LIST AFTER SEEN -> unread={}", entries[0].unread_count);

    svc.set_typing(&host, &conv, &bob.id, true).await?;
    let alice_view = svc.get_conversations(&host, &alice.id).await?;
    println!("ALICE SEES TYPING -> {}", alice_view[0].partner_typing);

    let notes = svc.get_notifications(&host, &bob.id).await?;
    println!("BOB NOTIFICATIONS -> {}", notes.len());

    Ok(())
}
