//! # Seed Data Generator
//!
//! Populates a node's catalog with demo data for development.
//!
//! ## Usage
//! ```bash
//! # Seed ./jukebox_dev.db with 20 artists (default)
//! cargo run -p jukebox-db --bin seed
//!
//! # Custom amount
//! cargo run -p jukebox-db --bin seed -- --artists 50
//!
//! # Specify database path
//! cargo run -p jukebox-db --bin seed -- --db ./data/archive.db
//! ```
//!
//! Every row goes through [`CatalogRepository`](jukebox_db::CatalogRepository),
//! so each one also lands in the change log and will replicate.

use chrono::Utc;
use serde_json::json;
use std::env;

use jukebox_core::CatalogTable;
use jukebox_db::{Database, DbConfig};

const GENRES: &[(&str, &str)] = &[
    ("Jazz", "#1f6feb"),
    ("Blues", "#0b3d91"),
    ("Rock", "#d73a49"),
    ("Soul", "#a371f7"),
    ("Funk", "#f0883e"),
    ("Folk", "#3fb950"),
];

const ARTIST_PREFIXES: &[&str] = &["The", "Little", "Big", "Blind", "Lonesome", "Electric"];
const ARTIST_NOUNS: &[&str] = &["Hollers", "Sparrows", "Ramblers", "Tigers", "Drifters"];
const COUNTRIES: &[&str] = &["US", "GB", "FR", "BR", "JP", "NG"];
const FORMATS: &[&str] = &["mp3", "flac", "ogg"];

const ALBUMS_PER_ARTIST: usize = 2;
const SONGS_PER_ALBUM: usize = 8;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let mut artists: usize = 20;
    let mut db_path = String::from("./jukebox_dev.db");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--artists" | "-a" => {
                if i + 1 < args.len() {
                    artists = args[i + 1].parse().unwrap_or(20);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Jukebox Archive Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -a, --artists <N>  Number of artists to generate (default: 20)");
                println!("  -d, --db <PATH>    Database file path (default: ./jukebox_dev.db)");
                println!("  -h, --help         Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    println!("🌱 Jukebox Archive Seed Data Generator");
    println!("======================================");
    println!("Database: {}", db_path);
    println!("Artists:  {}", artists);
    println!();

    let db = Database::new(DbConfig::new(&db_path)).await?;
    let catalog = db.catalog();

    println!("✓ Connected to database");
    println!("✓ Migrations applied");

    let existing = catalog.count(CatalogTable::Artists).await?;
    if existing > 0 {
        println!("⚠ Database already has {} artists", existing);
        println!("  Skipping seed to avoid duplicates.");
        println!("  Delete the database file to regenerate.");
        return Ok(());
    }

    let start = std::time::Instant::now();
    let now = Utc::now();

    let mut genre_ids = Vec::with_capacity(GENRES.len());
    for (name, color) in GENRES {
        let (row, _) = catalog
            .create(CatalogTable::Genres, &json!({"name": name, "color": color}), now)
            .await?;
        genre_ids.push(row["id"].clone());
    }

    let mut songs = 0usize;
    for seed in 0..artists {
        let name = format!(
            "{} {} {}",
            ARTIST_PREFIXES[seed % ARTIST_PREFIXES.len()],
            ARTIST_NOUNS[(seed / ARTIST_PREFIXES.len()) % ARTIST_NOUNS.len()],
            seed + 1
        );
        let (artist, _) = catalog
            .create(
                CatalogTable::Artists,
                &json!({
                    "name": name,
                    "country": COUNTRIES[seed % COUNTRIES.len()],
                    "formed_year": 1950 + (seed * 7 % 70) as i64,
                }),
                now,
            )
            .await?;

        for album_idx in 0..ALBUMS_PER_ARTIST {
            let (album, _) = catalog
                .create(
                    CatalogTable::Albums,
                    &json!({
                        "title": format!("{} Vol. {}", name, album_idx + 1),
                        "artist_id": artist["id"],
                        "total_tracks": SONGS_PER_ALBUM,
                    }),
                    now,
                )
                .await?;

            for track in 0..SONGS_PER_ALBUM {
                let n = seed * 100 + album_idx * 10 + track;
                catalog
                    .create(
                        CatalogTable::Songs,
                        &json!({
                            "title": format!("Track {}", track + 1),
                            "album_id": album["id"],
                            "artist_id": artist["id"],
                            "genre_id": genre_ids[n % genre_ids.len()],
                            "track_number": track + 1,
                            "duration": 120 + (n * 13 % 240) as i64,
                            "file_format": FORMATS[n % FORMATS.len()],
                            "file_size": 2_000_000 + (n * 7919 % 8_000_000) as i64,
                        }),
                        now,
                    )
                    .await?;
                songs += 1;
            }
        }

        if (seed + 1) % 10 == 0 {
            println!("  Generated {} artists...", seed + 1);
        }
    }

    catalog
        .create(
            CatalogTable::Playlists,
            &json!({"name": "Staff picks", "is_public": true}),
            now,
        )
        .await?;

    let elapsed = start.elapsed();
    println!();
    println!(
        "✓ Generated {} artists, {} albums, {} songs in {:?}",
        artists,
        artists * ALBUMS_PER_ARTIST,
        songs,
        elapsed
    );
    println!("  Change log entries: {}", db.change_log().count().await?);

    println!();
    println!("✓ Seed complete!");

    Ok(())
}
