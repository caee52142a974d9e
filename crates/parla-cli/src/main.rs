use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{debug, info, warn};

use parla_core::models::{TurnOptions, run_turn};
use parla_core::services::{
    ChatMode, HttpCompletionBackend, SearchService, SpeechService, TranscriptSource, VoiceCall,
};
use parla_core::{
    ClientSettings, Conversation, ConversationStore, Identity, Message, SettingsRepository,
    StoreEvent,
};

#[derive(Parser)]
#[command(name = "parla", version, about = "Chat, speech and search from the terminal")]
struct Cli {
    /// User whose conversations are loaded and saved. Overrides the settings file.
    #[arg(long, global = true)]
    user: Option<String>,

    /// Settings file. Defaults to the platform config directory.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List conversations, most recent first
    List,
    /// Print the messages and audio of a conversation
    Show { id: String },
    /// Send a message and stream the reply
    Chat {
        /// Continue this conversation instead of starting a new one
        #[arg(long)]
        conversation: Option<String>,
        /// System prompt for this turn
        #[arg(long)]
        system: Option<String>,
        /// Let the backend call tools
        #[arg(long)]
        function: bool,
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    Rename { id: String, title: String },
    Delete { id: String },
    /// List the voices available for speech
    Voices,
    /// Synthesize speech and attach it to a conversation
    Speak {
        /// Voice id or name. Defaults to the first voice offered
        #[arg(long)]
        voice: Option<String>,
        #[arg(long)]
        conversation: Option<String>,
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    /// Record a finished voice-agent call into a new conversation
    Call {
        /// Voice server id of the call, used to fetch its recording
        #[arg(long)]
        call_id: Option<String>,
        /// Transcript lines as `agent: ...` or `user: ...`
        #[arg(long = "line")]
        lines: Vec<String>,
    },
    /// Semantic search over the knowledge base
    Search {
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,
    },
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let repository = match &cli.settings {
        Some(path) => SettingsRepository::with_path(path),
        None => SettingsRepository::new()?,
    };
    let settings = repository
        .load()
        .await
        .context("Failed to load settings")?;
    debug!(?settings, "Settings loaded");

    match cli.command {
        Command::Voices => return print_voices(&settings).await,
        Command::Search { query } => return search(&settings, &query.join(" ")).await,
        _ => {}
    }

    let gateway = settings
        .persistence
        .connect()
        .await
        .context("Failed to open conversation storage")?;
    let store = ConversationStore::new(gateway);

    match cli.user.or_else(|| settings.user_id.clone()) {
        Some(user_id) => {
            if let Some(load) = store.set_identity(Some(Identity::new(user_id))) {
                load.await.context("Conversation load task failed")?;
            }
        }
        None => {
            warn!("No user configured, conversations will not be saved");
            store.set_identity(None);
        }
    }

    let outcome = run_command(&store, &settings, cli.command).await;
    store.flush().await;
    outcome
}

async fn run_command(store: &ConversationStore, settings: &ClientSettings, command: Command) -> Result<()> {
    match command {
        Command::List => {
            for conversation in store.conversations() {
                print_summary(&conversation);
            }
        }
        Command::Show { id } => {
            require(store, &id)?;
            store
                .select_conversation(&id)
                .await
                .context("Conversation refresh task failed")?;
            for message in store.current_messages() {
                print_message(&message);
            }
            for audio in store.current_audio_entries() {
                let status = if audio.audio_uri.is_empty() { "no audio" } else { "audio" };
                println!("[{}] {} ({})", audio.voice_name, audio.text, status);
            }
        }
        Command::Chat {
            conversation,
            system,
            function,
            text,
        } => {
            if let Some(id) = conversation {
                require(store, &id)?;
                store
                    .select_conversation(&id)
                    .await
                    .context("Conversation refresh task failed")?;
            }
            let options = TurnOptions {
                system_prompt: system.or_else(|| settings.system_prompt.clone()),
                mode: Some(if function { ChatMode::Function } else { settings.mode }),
            };
            chat(store, settings, &text.join(" "), &options).await?;
        }
        Command::Rename { id, title } => {
            require(store, &id)?;
            store.update_conversation_title(&id, &title);
            info!(conversation_id = %id, "Renamed conversation");
        }
        Command::Delete { id } => {
            require(store, &id)?;
            store.delete_conversation(&id);
        }
        Command::Speak {
            voice,
            conversation,
            text,
        } => {
            let speech = SpeechService::new(&settings.voice_server_url);
            let voices = speech.list_voices().await.context("Failed to list voices")?;
            let voice = match voice {
                Some(wanted) => voices
                    .into_iter()
                    .find(|v| v.id == wanted || v.name.eq_ignore_ascii_case(&wanted))
                    .ok_or_else(|| anyhow!("Unknown voice: {}", wanted))?,
                None => voices
                    .into_iter()
                    .next()
                    .ok_or_else(|| anyhow!("The voice server offers no voices"))?,
            };

            let entry = speech
                .speech_entry(&text.join(" "), &voice)
                .await
                .context("Speech synthesis failed")?;
            let id = store.add_audio_entry(entry, conversation.as_deref());
            println!("Saved speech by {} to {}", voice.name, id);
        }
        Command::Call { call_id, lines } => {
            let speech = SpeechService::new(&settings.voice_server_url);
            let mut call = VoiceCall::start(store);
            if let Some(call_id) = call_id {
                call.set_call_id(call_id);
            }
            for line in &lines {
                let (source, text) = parse_transcript_line(line)?;
                call.record_transcript(source, text);
            }
            let id = call.conversation_id().to_string();
            let entry = call.finish(&speech, &settings.recording_retry).await;
            println!("{}: {}", id, entry.text);
        }
        Command::Voices | Command::Search { .. } => {}
    }
    Ok(())
}

async fn chat(
    store: &ConversationStore,
    settings: &ClientSettings,
    text: &str,
    options: &TurnOptions,
) -> Result<()> {
    let backend = HttpCompletionBackend::new(settings.completion_url.as_str());
    let mut events = store.subscribe();
    let mut stdout = std::io::stdout();
    let mut printed = false;

    let turn = run_turn(store, &backend, text, options);
    tokio::pin!(turn);

    let result = loop {
        tokio::select! {
            result = &mut turn => break result,
            event = events.recv() => {
                if let Ok(StoreEvent::ReplyDelta { delta, .. }) = event {
                    print!("{}", delta);
                    stdout.flush()?;
                    printed = true;
                }
            }
        }
    };

    // Deltas published just before the turn finished
    loop {
        match events.try_recv() {
            Ok(StoreEvent::ReplyDelta { delta, .. }) => {
                print!("{}", delta);
                printed = true;
            }
            Ok(_) | Err(TryRecvError::Lagged(_)) => {}
            Err(_) => break,
        }
    }

    let reply = result?;
    if !printed && let Some(text) = reply.text() {
        print!("{}", text);
    }
    println!();
    Ok(())
}

async fn print_voices(settings: &ClientSettings) -> Result<()> {
    let speech = SpeechService::new(&settings.voice_server_url);
    for voice in speech.list_voices().await.context("Failed to list voices")? {
        println!("{}\t{}\t{}", voice.id, voice.name, voice.category);
    }
    Ok(())
}

async fn search(settings: &ClientSettings, query: &str) -> Result<()> {
    let dispatch = SearchService::new(settings.search_url.as_str()).dispatcher();
    let response = dispatch(query.to_string()).await.context("Search failed")?;

    println!("{} ({:.2})", response.result, response.similarity);
    for hit in response.all_results.iter().skip(1) {
        println!("  {:.2}  {}", hit.similarity, hit.text);
    }
    Ok(())
}

fn require(store: &ConversationStore, id: &str) -> Result<()> {
    if store.conversation(id).is_none() {
        bail!("No conversation with id {}", id);
    }
    Ok(())
}

fn parse_transcript_line(line: &str) -> Result<(TranscriptSource, &str)> {
    let (speaker, text) = line
        .split_once(':')
        .ok_or_else(|| anyhow!("Transcript line needs a speaker prefix: {}", line))?;
    let source = match speaker.trim().to_ascii_lowercase().as_str() {
        "agent" => TranscriptSource::Agent,
        "user" => TranscriptSource::User,
        other => bail!("Unknown speaker: {}", other),
    };
    Ok((source, text.trim()))
}

fn print_summary(conversation: &Conversation) {
    println!(
        "{}  {}  {}  ({} messages, {} audio)",
        conversation.id(),
        conversation.updated_at().format("%Y-%m-%d %H:%M"),
        conversation.title(),
        conversation.messages().len(),
        conversation.audio_entries().len()
    );
}

fn print_message(message: &Message) {
    let text = message.text().unwrap_or("[attachment]");
    let tool = if message.tool_used { " (tool)" } else { "" };
    println!("{}{}: {}", message.role.as_str(), tool, text);
}
