mod catalog;
mod http;
mod oracle;
mod protocol;
mod store;
mod ui;

use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::catalog::{MetadataResolver, NoCatalog, SpotifyCatalog};
use crate::oracle::GeminiOracle;
use crate::protocol::{
    ClueFilters, DialogueEngine, IdentificationEngine, LyricClue, ProtocolConfig, UserHandle,
};
use crate::store::SongStore;

/// Application configuration from CLI and environment
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Identify a song from lyric fragments or a guessing game")]
pub struct Config {
    /// SQLite database for saved songs and recent searches (":memory:" for none)
    #[arg(long, env = "DEJATUNE_DATABASE", default_value = "dejatune.sqlite", global = true)]
    database: PathBuf,
    /// Opaque user handle the results are stored under
    #[arg(long, env = "DEJATUNE_USER", default_value = "local", global = true)]
    user: String,
    /// Enable debug logging to stderr
    #[arg(long, global = true)]
    pub debug_log: bool,
    /// Timeout for each oracle, catalog and database call
    #[arg(long, default_value_t = 30, global = true)]
    timeout_secs: u64,
    /// Oracle calls fragment mode may spend before giving up
    #[arg(long, default_value_t = 10, global = true)]
    max_attempts: u32,
    /// Questions the guessing game must ask before it may guess
    #[arg(long, default_value_t = 3, global = true)]
    min_questions: usize,
    /// Gemini model used as the oracle
    #[arg(long, env = "DEJATUNE_MODEL", default_value = "gemini-2.0-flash", global = true)]
    model: String,
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true, hide = true)]
    gemini_api_key: Option<String>,
    #[arg(long, env = "SPOTIFY_CLIENT_ID", hide_env_values = true, hide = true)]
    spotify_client_id: Option<String>,
    #[arg(long, env = "SPOTIFY_CLIENT_SECRET", hide_env_values = true, hide = true)]
    spotify_client_secret: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Identify a song from remembered lyric fragments
    Think {
        /// A remembered piece of the lyrics (repeatable); prompted for if absent
        #[arg(short, long = "fragment")]
        fragments: Vec<String>,
        #[arg(long)]
        genre: Option<String>,
        /// Era or release year
        #[arg(long)]
        year: Option<String>,
        #[arg(long)]
        mood: Option<String>,
        #[arg(long)]
        vibe: Option<String>,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
        /// Save the result without asking
        #[arg(long)]
        yes: bool,
    },
    /// Play a guessing game: answer questions until the song is found
    Chat {
        /// Opening clue; prompted for if absent
        first_clue: Vec<String>,
    },
    /// List saved songs
    Saved {
        /// Remove the saved song with this title
        #[arg(long, requires = "artist")]
        remove: Option<String>,
        /// Artist of the song to remove
        #[arg(long, requires = "remove")]
        artist: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// List recent searches
    Recent {
        #[arg(long)]
        json: bool,
    },
}

impl Config {
    fn protocol(&self) -> ProtocolConfig {
        ProtocolConfig {
            max_attempts: self.max_attempts.max(1),
            call_timeout: Duration::from_secs(self.timeout_secs.max(1)),
            min_questions: self.min_questions,
            ..ProtocolConfig::default()
        }
    }

    fn oracle(&self) -> Result<GeminiOracle, Box<dyn Error + Send + Sync>> {
        match self.gemini_api_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => Ok(GeminiOracle::new(key, &self.model)),
            _ => Err("GEMINI_API_KEY is not set".into()),
        }
    }

    fn catalog(&self) -> Arc<dyn MetadataResolver> {
        match (&self.spotify_client_id, &self.spotify_client_secret) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => {
                Arc::new(SpotifyCatalog::new(id, secret))
            }
            _ => {
                tracing::info!("Spotify credentials not set; songs will have no album metadata");
                Arc::new(NoCatalog)
            }
        }
    }

    async fn store(&self) -> Result<SongStore, Box<dyn Error + Send + Sync>> {
        let store = if self.database.as_os_str() == ":memory:" {
            SongStore::in_memory().await?
        } else {
            SongStore::open(&self.database).await?
        };
        Ok(store)
    }
}

fn init_tracing(debug: bool) {
    let default = if debug { "dejatune=debug" } else { "dejatune=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cfg = Config::parse();
    init_tracing(cfg.debug_log);

    let user = UserHandle::new(cfg.user.trim());
    let result = run(&cfg, user).await;

    // Print error if any, for better diagnostics
    if let Err(e) = &result {
        eprintln!("Error: {e}");
    }
    result
}

async fn run(cfg: &Config, user: UserHandle) -> Result<(), Box<dyn Error + Send + Sync>> {
    let store = cfg.store().await?;
    tracing::debug!(database = %cfg.database.display(), user = %user, "Store ready");

    match cfg.command.clone() {
        Command::Think {
            fragments,
            genre,
            year,
            mood,
            vibe,
            json,
            yes,
        } => {
            let clue = LyricClue::new(fragments).with_filters(ClueFilters {
                genre: non_blank(genre),
                era: non_blank(year),
                mood: non_blank(mood),
                vibe: non_blank(vibe),
            });
            let engine = IdentificationEngine::new(
                Arc::new(cfg.oracle()?),
                cfg.catalog(),
                Arc::new(store),
                user,
                cfg.protocol(),
            );
            let options = ui::fragment::FragmentOptions {
                clue,
                json,
                auto_accept: yes,
            };
            ui::fragment::run(&engine, options).await
        }
        Command::Chat { first_clue } => {
            let first_clue = non_blank(Some(first_clue.join(" ")));
            let engine = DialogueEngine::new(
                Arc::new(cfg.oracle()?),
                cfg.catalog(),
                Arc::new(store),
                user,
                cfg.protocol(),
            );
            ui::chat::run(&engine, first_clue).await
        }
        Command::Saved {
            remove: Some(song),
            artist: Some(artist),
            ..
        } => ui::listing::remove_saved(&store, &user, &song, &artist).await,
        Command::Saved { json, .. } => ui::listing::show_saved(&store, &user, json).await,
        Command::Recent { json } => ui::listing::show_recent(&store, &user, json).await,
    }
}
