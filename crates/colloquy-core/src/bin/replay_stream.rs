use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use colloquy_core::render::DisplayList;
use colloquy_core::store::{HistoryStore, JsonHistoryStore};
use colloquy_core::streaming::StreamEvent;
use colloquy_core::tracing_setup::init_tracing;
use colloquy_core::{ActiveSelection, CoreConfig, CoreEvent, CoreRuntime, HistoryKey, Owner};

#[derive(Parser)]
#[command(name = "replay_stream")]
#[command(about = "Replay recorded stream events against a history directory")]
struct Cli {
    /// JSONL file, one stream event per line
    events: PathBuf,

    /// Data directory holding settings and topic histories
    #[arg(long, short = 'd')]
    data_dir: Option<PathBuf>,

    /// Agent that owns the conversation to watch
    #[arg(long, conflicts_with = "group")]
    agent: Option<String>,

    /// Group that owns the conversation to watch
    #[arg(long)]
    group: Option<String>,

    /// Topic of the watched conversation; it is opened as the current view
    #[arg(long)]
    topic: Option<String>,

    /// Release text through the pacer instead of all at once
    #[arg(long)]
    smooth: bool,

    /// Print the rendered HTML of the watched conversation
    #[arg(long)]
    html: bool,
}

impl Cli {
    fn watched(&self) -> Result<Option<HistoryKey>> {
        let owner = match (&self.agent, &self.group) {
            (Some(agent), _) => Owner::Agent(agent.clone()),
            (None, Some(group)) => Owner::Group(group.clone()),
            (None, None) => return Ok(None),
        };
        let Some(topic) = &self.topic else {
            bail!("--topic is required with --agent or --group");
        };
        Ok(Some(HistoryKey::new(owner, topic.clone())))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = cli
        .data_dir
        .clone()
        .map(CoreConfig::new)
        .unwrap_or_default();
    let watched = cli.watched()?;

    let display = Arc::new(DisplayList::new());
    let mut runtime = CoreRuntime::new(config.clone(), display.clone())
        .context("failed to set up runtime")?;
    runtime
        .settings()
        .update(|s| s.enable_smooth_streaming = cli.smooth);
    if cli.smooth {
        runtime.start_pacer();
    }
    let mut events = runtime
        .take_event_receiver()
        .context("event receiver already taken")?;

    if let Some(key) = &watched {
        let selection = ActiveSelection::new(key.owner.clone(), key.topic_id.clone());
        let loaded = runtime.open_conversation(selection).await?;
        println!("Opened topic {} ({} messages)", key.topic_id, loaded);
    }

    let input = tokio::fs::read_to_string(&cli.events)
        .await
        .with_context(|| format!("failed to read {}", cli.events.display()))?;
    let mut replayed = 0;
    for (line_no, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event: StreamEvent = serde_json::from_str(line)
            .with_context(|| format!("line {}: not a stream event", line_no + 1))?;
        let id = event.message_id().to_string();
        if let Err(e) = runtime.handle_stream_event(event).await {
            eprintln!("line {} ({}): {}", line_no + 1, id, e);
        }
        replayed += 1;
    }
    println!("Replayed {} events", replayed);

    while let Ok(event) = events.try_recv() {
        match event {
            CoreEvent::StreamFinalized {
                message_id,
                finish_reason,
            } => println!("  finalized {} ({})", message_id, finish_reason),
            CoreEvent::Notification { level, text } => println!("  {:?}: {}", level, text),
        }
    }

    let Some(key) = watched else {
        return Ok(());
    };
    let store = JsonHistoryStore::new(&config.data_dir);
    let history = store.fetch(&key).await?;
    println!("\nCommitted history of {} ({} messages):", key.topic_id, history.len());
    println!("{}", serde_json::to_string_pretty(&history)?);

    if cli.html {
        println!("\nRendered:");
        for node in display.nodes() {
            println!("[{}] {}", node.message_id, node.content_html.trim_end());
        }
    }
    Ok(())
}
