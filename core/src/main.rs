/// ChatSync terminal client - main entry point
use chatsync_core::model::{Message, MessageDirection, Record, RecordId};
use chatsync_core::{
    ChatSession, Config, DocumentStore, RecentConversations, SessionUpdate, SledStore,
};
use colored::*;
use std::collections::HashSet;
use std::env;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let data_dir = config.resolved_data_dir();
    let store: Arc<dyn DocumentStore> = Arc::new(
        SledStore::new(&data_dir).map_err(|e| anyhow::anyhow!("Store error: {}", e))?,
    );
    info!("Chatting as {} with {}", config.local.id, config.peer.id);

    let (session, mut updates) = ChatSession::open(
        store.clone(),
        config.sync.clone(),
        config.local.clone(),
        config.peer.clone(),
    )
    .await?;

    // The peer's side of the same chat, driven by `/peer <text>`
    let (peer_session, mut peer_updates) = ChatSession::open(
        store.clone(),
        config.sync.clone(),
        config.peer.clone(),
        config.local.clone(),
    )
    .await?;
    tokio::spawn(async move { while peer_updates.recv().await.is_some() {} });

    let recent = RecentConversations::open(store.clone(), &config.sync, &config.local.id).await?;

    let local_id = session.local_id().to_string();
    let peer_name = config.peer.display_name.clone();
    let printer = tokio::spawn(async move {
        let mut transcript = Transcript::default();
        while let Some(update) = updates.recv().await {
            render(&update, &mut transcript, &local_id, &peer_name);
        }
    });

    print_help(&config);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line {
            "/quit" => break,
            "/help" => print_help(&config),
            "/recent" => {
                let previews = recent.snapshot().await;
                if previews.is_empty() {
                    println!("{}", "No conversations yet".dimmed());
                }
                for p in previews {
                    println!(
                        "  {} {} {}",
                        p.counterpart.display_name.bright_white().bold(),
                        p.last_message_body,
                        chatsync_core::model::readable_date_time(&p.last_message_timestamp).dimmed()
                    );
                }
            }
            "/summary" => {
                let snapshot = session.snapshot().await?;
                let label = format!("Conversation with {}:", session.peer_id());
                match snapshot.summary_id() {
                    Some(id) => println!("{} {}", label.bright_white(), id.cyan()),
                    None => println!("{} {:?}", label.bright_white(), snapshot.resolver),
                }
            }
            _ => {
                if let Some(text) = line.strip_prefix("/peer ") {
                    peer_session.send(text.trim()).await?;
                } else if line.starts_with('/') {
                    eprintln!("{} Unknown command: {}", "✗".red().bold(), line.red());
                } else {
                    session.send(line).await?;
                }
            }
        }
    }

    session.close().await?;
    peer_session.close().await?;
    recent.close().await;
    let _ = printer.await;

    Ok(())
}

fn print_help(config: &Config) {
    println!("{}", "💬 ChatSync".bright_cyan().bold());
    println!(
        "  {} ↔ {}",
        config.local.display_name.green(),
        config.peer.display_name.cyan()
    );
    println!("  {}          Send a message", "<text>".cyan());
    println!("  {}   Send as {}", "/peer <text>".cyan(), config.peer.display_name);
    println!("  {}        List recent conversations", "/recent".cyan());
    println!("  {}       Show the conversation record", "/summary".cyan());
    println!("  {}          Exit", "/quit".cyan());
}

/// Records the terminal has already printed.
///
/// A late message can sort anywhere in the timeline, so new rows are found
/// by id rather than by position.
#[derive(Default)]
struct Transcript {
    printed: HashSet<RecordId>,
}

impl Transcript {
    /// Records not printed yet, in timeline order
    fn unseen<'a>(&mut self, messages: &'a [Record<Message>]) -> Vec<&'a Record<Message>> {
        messages
            .iter()
            .filter(|r| self.printed.insert(r.id.clone()))
            .collect()
    }
}

fn render(update: &SessionUpdate, transcript: &mut Transcript, local_id: &str, peer_name: &str) {
    match update {
        SessionUpdate::TimelineChanged { diff, messages } => {
            if diff.inserted_count == 0 {
                return;
            }
            for record in transcript.unseen(messages) {
                print_message(&record.value, local_id, peer_name);
            }
        }
        SessionUpdate::SubscriptionError { stream, error } => {
            eprintln!("{} {} stopped: {}", "✗".red().bold(), stream, error.red());
        }
        SessionUpdate::Closed => println!("{}", "Session closed".dimmed()),
    }
}

fn print_message(message: &Message, local_id: &str, peer_name: &str) {
    let when = message.readable_date_time();
    match message.direction(local_id) {
        MessageDirection::Sent => {
            println!("{} {} {}", "me".green().bold(), message.body, when.dimmed())
        }
        MessageDirection::Received => {
            println!("{} {} {}", peer_name.cyan().bold(), message.body, when.dimmed())
        }
    }
}
