use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use chrono::{DateTime, Local, TimeZone, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use contextual_memory::{
    default_db_path, AddNoteOutcome, ArchiveHit, ArchiveMessage, ArchiveQuery, EngineConfig,
    HashingEmbedder, InterventionDecision, MemoryError, MemoryOrchestrator, ObservedMessage,
    Scope, DEFAULT_ARCHIVE_LIMIT, DEFAULT_NOTE_LIMIT,
};

/// Timezone for datetime display
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum TzOption {
    /// Use local timezone
    #[default]
    Local,
    /// Use UTC (Zulu time)
    Utc,
}

/// Note scope on the command line
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum ScopeArg {
    #[default]
    User,
    Server,
}

impl From<ScopeArg> for Scope {
    fn from(arg: ScopeArg) -> Self {
        match arg {
            ScopeArg::User => Scope::User,
            ScopeArg::Server => Scope::Server,
        }
    }
}

#[derive(Parser)]
#[command(name = "contextual-memory")]
#[command(about = "Layered conversational memory: notes, archive, relationships, mood", long_about = None)]
struct Cli {
    /// Path to the database file (default: ~/.contextual_memory.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Output in JSON format (default is compact text)
    #[arg(long, global = true)]
    json: bool,

    /// TOML file with engine settings (thresholds, windows, cooldown)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Timezone for datetime display (default: local for text, utc for JSON)
    #[arg(long, global = true, value_enum)]
    tz: Option<TzOption>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database (creates if not exists)
    Init,

    /// Store a note about a user or server
    Remember {
        /// User or server id the note is about
        subject: String,

        /// The note text
        text: String,

        #[arg(short, long, value_enum, default_value_t = ScopeArg::User)]
        scope: ScopeArg,
    },

    /// List notes for a subject, or rank them against a query
    Recall {
        subject: String,

        /// Rank notes by similarity to this text instead of listing them
        #[arg(short, long)]
        query: Option<String>,

        #[arg(short, long, value_enum, default_value_t = ScopeArg::User)]
        scope: ScopeArg,

        #[arg(short, long, default_value_t = DEFAULT_NOTE_LIMIT)]
        limit: usize,
    },

    /// Remove a note by its 0-based index (see `recall`)
    Forget {
        subject: String,

        index: usize,

        #[arg(short, long, value_enum, default_value_t = ScopeArg::User)]
        scope: ScopeArg,
    },

    /// Show or set the name a user wants to be called
    Nickname {
        subject: String,

        /// New nickname (omit to show the current one)
        name: Option<String>,
    },

    /// Feed one message into the archive (and mood window, with --sentiment)
    Observe {
        /// Conversation (channel) id
        conversation: String,

        /// Message id, unique within the conversation
        id: String,

        author_id: String,

        author_name: String,

        text: String,

        /// Sentiment score in [-1, 1]
        #[arg(long, allow_hyphen_values = true)]
        sentiment: Option<f64>,

        /// Optional datetime override (RFC3339 format, e.g. "2024-01-15T10:30:00Z")
        #[arg(short, long)]
        datetime: Option<String>,
    },

    /// Search one conversation's archive
    Query {
        conversation: String,

        text: String,

        #[arg(short, long, default_value_t = DEFAULT_ARCHIVE_LIMIT)]
        limit: usize,

        /// Only return messages by this author id
        #[arg(short, long)]
        author: Option<String>,
    },

    /// Search several conversations and merge the results
    Search {
        text: String,

        /// Comma-separated conversation ids
        #[arg(short, long, value_delimiter = ',', required = true)]
        conversations: Vec<String>,

        #[arg(short, long, default_value_t = DEFAULT_ARCHIVE_LIMIT)]
        limit: usize,
    },

    /// Show a conversation's mood, optionally recording a sample first
    Mood {
        conversation: String,

        /// Sentiment score in [-1, 1] to record
        #[arg(long, allow_hyphen_values = true)]
        sample: Option<f64>,
    },

    /// Show who a subject talks with, optionally recording an interaction first
    Relationships {
        subject: String,

        /// Record an interaction on this topic between the subject and --with
        #[arg(long, requires = "with")]
        topic: Option<String>,

        /// Comma-separated partner ids for --topic
        #[arg(long, value_delimiter = ',')]
        with: Vec<String>,
    },

    /// Check whether a message would trigger an unprompted intervention
    Intervene {
        conversation: String,

        text: String,
    },

    /// Show archive partitions and counts
    Status,

    /// Archive historical messages from a JSON-lines file
    Backfill {
        /// One message per line: {"conversation_id","id","text","author_id","author_name","timestamp"}
        file: PathBuf,
    },

    /// Delete every archive partition
    Reset {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = cli.db.unwrap_or_else(default_db_path);

    // Determine timezone: explicit --tz wins, else local for text, utc for json
    let use_local = match cli.tz {
        Some(TzOption::Local) => true,
        Some(TzOption::Utc) => false,
        None => !cli.json,
    };

    let result = match load_config(cli.config.as_deref()) {
        Ok(config) => run(cli.command, &db_path, config, cli.json, use_local).await,
        Err(e) => Err(e.into()),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig, MemoryError> {
    match path {
        Some(path) => EngineConfig::from_file(path),
        None => Ok(EngineConfig::default()),
    }
}

fn open_engine(db_path: &Path, config: EngineConfig) -> Result<MemoryOrchestrator, MemoryError> {
    MemoryOrchestrator::open(db_path, config, Arc::new(HashingEmbedder::default()), None)
}

async fn run(
    command: Commands,
    db_path: &Path,
    config: EngineConfig,
    json_output: bool,
    use_local: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = open_engine(db_path, config)?;

    match command {
        Commands::Init => {
            let status = engine.status()?;
            if json_output {
                let result = serde_json::json!({
                    "success": true,
                    "database": db_path.display().to_string(),
                    "message": "Database initialized successfully",
                    "partitions": status.archive.partition_count,
                });
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!(
                    "SUCCESS: Database initialized at {} ({} partitions)",
                    db_path.display(),
                    status.archive.partition_count
                );
            }
        }

        Commands::Remember {
            subject,
            text,
            scope,
        } => {
            let scope = Scope::from(scope);
            let outcome = engine.notes().add_note(scope, &subject, &text).await?;
            if json_output {
                let result = serde_json::json!({
                    "scope": scope,
                    "subject_id": subject,
                    "outcome": outcome,
                });
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                match outcome {
                    AddNoteOutcome::Added => println!("REMEMBERED ({} {}): {}", scope, subject, text.trim()),
                    AddNoteOutcome::Duplicate => println!("ALREADY KNOWN ({} {}): {}", scope, subject, text.trim()),
                    AddNoteOutcome::EmbeddingUnavailable => {
                        return Err("embedding unavailable, note not stored".into())
                    }
                }
            }
        }

        Commands::Recall {
            subject,
            query,
            scope,
            limit,
        } => {
            let scope = Scope::from(scope);
            let notes = match query {
                Some(query) => engine.notes().recall(scope, &subject, &query, limit).await?,
                None => engine
                    .notes()
                    .list_notes(scope, &subject)?
                    .into_iter()
                    .map(|note| note.text)
                    .collect(),
            };
            if json_output {
                let result = serde_json::json!({
                    "count": notes.len(),
                    "notes": notes,
                });
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("# {} notes for {} {}\n", notes.len(), scope, subject);
                for (i, text) in notes.iter().enumerate() {
                    println!("  [{}] {}", i, text);
                }
            }
        }

        Commands::Forget {
            subject,
            index,
            scope,
        } => {
            let note = engine.notes().remove_note(scope.into(), &subject, index)?;
            if json_output {
                println!("{}", serde_json::to_string_pretty(&note)?);
            } else {
                println!("FORGOT ({} {}): {}", note.scope, note.subject_id, note.text);
            }
        }

        Commands::Nickname { subject, name } => {
            if let Some(name) = name {
                engine.set_nickname(&subject, &name)?;
            }
            let nickname = engine.notes().nickname(&subject)?;
            if json_output {
                let result = serde_json::json!({
                    "subject_id": subject,
                    "nickname": nickname,
                });
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                match nickname {
                    Some(nickname) => println!("{} -> {}", subject, nickname),
                    None => println!("{} has no nickname", subject),
                }
            }
        }

        Commands::Observe {
            conversation,
            id,
            author_id,
            author_name,
            text,
            sentiment,
            datetime,
        } => {
            let mut message = ObservedMessage::new(conversation, id, author_id, author_name, text);
            if let Some(datetime) = datetime {
                message = message.with_timestamp(parse_datetime(&datetime)?);
            }
            if let Some(score) = sentiment {
                message = message.with_sentiment(score);
            }
            let outcome = engine.observe(message).await;
            if json_output {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                println!(
                    "{}",
                    if outcome.archived { "ARCHIVED" } else { "SKIPPED (short, duplicate or unembeddable)" }
                );
                if let Some(window) = outcome.mood {
                    println!("MOOD: {} ({:.2} over {} samples)", window.mood, window.average, window.samples.len());
                }
            }
        }

        Commands::Query {
            conversation,
            text,
            limit,
            author,
        } => {
            let result = engine
                .archive()
                .query(&conversation, &text, limit, author.as_deref())
                .await?;
            if json_output {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                match &result {
                    ArchiveQuery::EmptyPartition => println!("# No memories for {} yet", conversation),
                    ArchiveQuery::EmbeddingFailed => println!("# Could not embed the query"),
                    ArchiveQuery::NoCandidates => println!("# No matching messages"),
                    ArchiveQuery::AllOverThreshold => println!("# Nothing relevant enough"),
                    ArchiveQuery::Hits(hits) => {
                        println!("# {} results for \"{}\"\n", hits.len(), text);
                        for hit in hits {
                            print_hit(hit, None, use_local);
                        }
                    }
                }
            }
        }

        Commands::Search {
            text,
            conversations,
            limit,
        } => {
            let hits = engine
                .search()
                .query(&text, &conversations, limit, |id| Some(id.to_string()))
                .await?;
            if json_output {
                let result = serde_json::json!({
                    "query": text,
                    "count": hits.len(),
                    "hits": hits,
                });
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("# {} results for \"{}\" across {} conversations\n", hits.len(), text, conversations.len());
                for hit in &hits {
                    print_hit(&hit.hit, Some(&hit.label), use_local);
                }
            }
        }

        Commands::Mood {
            conversation,
            sample,
        } => {
            if let Some(score) = sample {
                engine.mood().record_sample(&conversation, score)?;
            }
            let window = engine.mood().window(&conversation)?;
            if json_output {
                println!("{}", serde_json::to_string_pretty(&window)?);
            } else {
                match window {
                    Some(w) => println!(
                        "MOOD {}: {} (average {:.2} over {} samples)",
                        conversation,
                        w.mood,
                        w.average,
                        w.samples.len()
                    ),
                    None => println!("MOOD {}: no samples", conversation),
                }
            }
        }

        Commands::Relationships {
            subject,
            topic,
            with,
        } => {
            if let Some(topic) = topic {
                let mut participants = with;
                participants.push(subject.clone());
                engine.social().record_interaction(&participants, Some(&topic))?;
            }
            let summaries = engine.social().summarize(&subject)?;
            if json_output {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else {
                println!("# {} relationships for {}\n", summaries.len(), subject);
                for s in &summaries {
                    println!("  {}", s.description);
                }
            }
        }

        Commands::Intervene { conversation, text } => {
            let decision = engine.evaluate_intervention(&conversation, &text).await;
            if json_output {
                println!("{}", serde_json::to_string_pretty(&decision)?);
            } else {
                match decision {
                    InterventionDecision::Triggered(i) => println!(
                        "TRIGGERED ({:.2}): {} [{} {}]",
                        i.similarity, i.note.text, i.note.scope, i.note.subject_id
                    ),
                    InterventionDecision::NoMatch { best_similarity } => match best_similarity {
                        Some(s) => println!("NO MATCH (best {:.2})", s),
                        None => println!("NO MATCH"),
                    },
                    InterventionDecision::TooShort => println!("TOO SHORT"),
                    InterventionDecision::CoolingDown { remaining_secs } => {
                        println!("COOLING DOWN ({}s left)", remaining_secs)
                    }
                    InterventionDecision::EmbeddingFailed => println!("EMBEDDING FAILED"),
                }
            }
        }

        Commands::Status => {
            let status = engine.status()?;
            if json_output {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("STATUS:");
                println!("  Notes:      {}", status.note_count);
                println!("  Partitions: {}", status.archive.partition_count);
                println!("  Archived:   {}", status.archive.total_items);
                for p in &status.archive.partitions {
                    println!("    {:<24} {:>6}  ({})", p.name, p.item_count, p.conversation_id);
                }
            }
        }

        Commands::Backfill { file } => {
            let messages = read_jsonl(&file)?;
            let report = engine.backfill(messages).await;
            if json_output {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("BACKFILLED: {} added of {} processed", report.added, report.processed);
            }
        }

        Commands::Reset { yes } => {
            if !yes {
                return Err(MemoryError::InvalidInput(
                    "Refusing to delete the archive without --yes".to_string(),
                )
                .into());
            }
            let removed = engine.reset_archive()?;
            if json_output {
                let result = serde_json::json!({ "removed_partitions": removed });
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("RESET: removed {} partitions", removed);
            }
        }
    }

    Ok(())
}

/// Read backfill messages, one JSON object per non-empty line.
fn read_jsonl(path: &Path) -> Result<Vec<ArchiveMessage>, Box<dyn std::error::Error>> {
    let reader = BufReader::new(File::open(path)?);
    let mut messages = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let message: ArchiveMessage = serde_json::from_str(&line)
            .map_err(|e| MemoryError::InvalidInput(format!("line {}: {}", n + 1, e)))?;
        messages.push(message);
    }
    Ok(messages)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, MemoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MemoryError::InvalidInput(format!("Invalid datetime '{}': {}", s, e)))
}

/// Format datetime based on timezone option
fn format_datetime(dt: &DateTime<Utc>, use_local: bool) -> String {
    if use_local {
        Local
            .from_utc_datetime(&dt.naive_utc())
            .format("%Y-%m-%d %H:%M")
            .to_string()
    } else {
        dt.format("%Y-%m-%d %H:%M").to_string()
    }
}

/// Format an archive hit for text output
fn print_hit(hit: &ArchiveHit, label: Option<&str>, use_local: bool) {
    let label = label.map(|l| format!("#{} | ", l)).unwrap_or_default();
    println!(
        "--- {}{} | {} | {:.3} ---\n{}",
        label,
        format_datetime(&hit.entry.timestamp, use_local),
        hit.entry.author_name,
        hit.distance,
        hit.entry.text
    );
}
