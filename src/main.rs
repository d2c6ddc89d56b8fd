use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

use docchat::commands::{chat, knowledge};
use docchat::{load_config, AppState};

#[derive(Parser)]
#[command(name = "docchat", version, about = "Chat with your documents")]
struct Cli {
    /// Extra TOML config file, layered over the default locations.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add a PDF, text or Markdown file to the knowledge base (replaces an earlier upload of the same name).
    Ingest { file: PathBuf },
    /// List loaded documents.
    Documents,
    /// Remove one document from the knowledge base.
    Forget { source: String },
    /// Remove every document from the knowledge base.
    Reset,
    /// Ask a single question.
    Ask {
        question: String,
        /// Continue an existing session instead of starting a new one.
        #[arg(long)]
        session: Option<String>,
        /// Persona preset name or free-text style directive.
        #[arg(long, default_value = "")]
        persona: String,
        /// Answer only from the loaded documents.
        #[arg(long)]
        strict: bool,
    },
    /// Interactive chat loop.
    Chat {
        #[arg(long)]
        session: Option<String>,
        #[arg(long, default_value = "")]
        persona: String,
        #[arg(long)]
        strict: bool,
    },
    /// List sessions, newest first.
    Sessions,
    /// Print the messages of a session.
    History { session: String },
    /// Rename a session.
    Rename { session: String, subject: String },
    /// Delete a session and all its messages.
    Delete { session: String },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(message) = run(cli).await {
        eprintln!("{message}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let config = load_config(cli.config.as_deref()).map_err(|e| e.to_string())?;
    let state = AppState::from_config(config).map_err(|e| e.to_string())?;

    match cli.command {
        Command::Ingest { file } => {
            println!("{}", knowledge::upload_document(&state, &file).await?);
        }
        Command::Documents => {
            let documents = knowledge::list_documents(&state)?;
            if documents.is_empty() {
                println!("No documents loaded.");
            }
            for doc in documents {
                println!("{}\t{} chunks", doc.source, doc.chunk_count);
            }
        }
        Command::Forget { source } => println!("{}", knowledge::delete_document(&state, &source)?),
        Command::Reset => println!("{}", knowledge::clear_knowledge_base(&state)?),
        Command::Ask {
            question,
            session,
            persona,
            strict,
        } => {
            let session = session.unwrap_or_else(chat::new_session);
            let turn = chat::send_message(&state, &session, &question, &persona, strict).await?;
            println!("{}", turn.response_text);
            eprintln!("session: {session}");
        }
        Command::Chat {
            session,
            persona,
            strict,
        } => chat_loop(&state, session, persona, strict).await?,
        Command::Sessions => {
            for s in chat::list_sessions(&state)? {
                println!("{}\t{}\t{}", s.session_id, s.created_at, s.subject);
            }
        }
        Command::History { session } => {
            for m in chat::get_history(&state, &session)? {
                println!("[{}] {}: {}", m.created_at, m.role, m.content);
            }
        }
        Command::Rename { session, subject } => {
            chat::rename_session(&state, &session, &subject)?;
            println!("Renamed.");
        }
        Command::Delete { session } => {
            chat::delete_session(&state, &session)?;
            println!("Deleted.");
        }
    }
    Ok(())
}

async fn chat_loop(
    state: &AppState,
    session: Option<String>,
    mut persona: String,
    mut strict: bool,
) -> Result<(), String> {
    let mut session = session.unwrap_or_else(chat::new_session);
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("session {session} (strict: {strict}). Commands: /new, /strict, /persona <text>, /quit");
    loop {
        stdout.write_all(b"> ").await.map_err(|e| e.to_string())?;
        stdout.flush().await.map_err(|e| e.to_string())?;

        let Some(line) = lines.next_line().await.map_err(|e| e.to_string())? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/new" => {
                session = chat::new_session();
                println!("session {session}");
            }
            "/strict" => {
                strict = !strict;
                println!("strict mode {}", if strict { "on" } else { "off" });
            }
            _ if line.starts_with("/persona") => {
                persona = line.trim_start_matches("/persona").trim().to_string();
                println!("persona set");
            }
            question => match chat::send_message(state, &session, question, &persona, strict).await {
                Ok(turn) => println!("{}\n", turn.response_text),
                // keep the loop alive through outages
                Err(message) => eprintln!("{message}"),
            },
        }
    }
    Ok(())
}
