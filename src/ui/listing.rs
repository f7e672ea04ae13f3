//! `saved` and `recent` subcommands.

use std::error::Error;

use crate::protocol::UserHandle;
use crate::store::{ResultSink, SavedSong, SongStore};

const RECENT_LIMIT: u32 = 20;

fn saved_line(song: &SavedSong) -> String {
    let mut line = format!("{} by {}", song.song, song.artist);
    if let Some(album) = &song.metadata.album_name {
        line.push_str(&format!(" ({album})"));
    }
    line
}

/// Show the short date part of an RFC 3339 timestamp.
fn short_date(timestamp: &str) -> &str {
    timestamp.get(..10).unwrap_or(timestamp)
}

pub async fn show_saved(
    store: &SongStore,
    user: &UserHandle,
    json: bool,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let songs = store.list_saved(user).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&songs)?);
        return Ok(());
    }
    if songs.is_empty() {
        println!("No saved songs yet.");
        return Ok(());
    }
    for song in &songs {
        println!("{}  {}", short_date(&song.timestamp), saved_line(song));
    }
    Ok(())
}

pub async fn remove_saved(
    store: &SongStore,
    user: &UserHandle,
    song: &str,
    artist: &str,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    store.remove(user, song, artist).await?;
    tracing::info!(song, artist, "Removed saved song");
    println!("Removed \"{song}\" by {artist}.");
    Ok(())
}

pub async fn show_recent(
    store: &SongStore,
    user: &UserHandle,
    json: bool,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let entries = store.list_recent(user, RECENT_LIMIT).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No recent searches.");
        return Ok(());
    }
    for entry in &entries {
        println!("{}  {} by {}", short_date(&entry.timestamp), entry.song, entry.artist);
    }
    Ok(())
}
