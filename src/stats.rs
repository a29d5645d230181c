//! Database statistics (`persona stats`).
//!
//! Summarizes what is stored: chunks per personality, template lineages,
//! and durable cache entries.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::migrate;

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;

    let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(&pool)
        .await?;
    let template_versions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM templates")
        .fetch_one(&pool)
        .await?;
    let now = chrono::Utc::now().timestamp();
    let cache_live: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM cache_entries WHERE expires_at > ?")
            .bind(now)
            .fetch_one(&pool)
            .await?;
    let cache_total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cache_entries")
        .fetch_one(&pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Persona Harness Database Stats");
    println!("==============================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Chunks:      {}", total_chunks);
    println!("  Templates:   {} versions", template_versions);
    println!("  Cache:       {} live / {} stored", cache_live, cache_total);

    let rows = sqlx::query(
        r#"
        SELECT
            c.personality_id,
            COUNT(*) AS chunk_count,
            COUNT(DISTINCT c.source) AS source_count,
            MAX(c.created_at) AS last_ingest
        FROM chunks c
        GROUP BY c.personality_id
        ORDER BY c.personality_id
        "#,
    )
    .fetch_all(&pool)
    .await?;

    println!();
    println!("  By personality:");
    println!(
        "  {:<20} {:<14} {:>8} {:>8}   {}",
        "PERSONALITY", "DOMAIN", "CHUNKS", "SOURCES", "LAST INGEST"
    );
    println!("  {}", "-".repeat(72));

    for profile in &config.personalities {
        let row = rows.iter().find(|r| {
            let id: String = r.get("personality_id");
            id == profile.id
        });
        let (chunks, sources, last) = match row {
            Some(r) => (
                r.get::<i64, _>("chunk_count"),
                r.get::<i64, _>("source_count"),
                format_ts_relative(r.get::<i64, _>("last_ingest")),
            ),
            None => (0, 0, "never".to_string()),
        };
        println!(
            "  {:<20} {:<14} {:>8} {:>8}   {}",
            profile.id,
            profile.domain.to_string(),
            chunks,
            sources,
            last
        );
    }

    // Partitions left behind by personalities removed from the config.
    for r in &rows {
        let id: String = r.get("personality_id");
        if !config.personalities.iter().any(|p| p.id == id) {
            println!(
                "  {:<20} {:<14} {:>8} {:>8}   {}",
                id,
                "(unconfigured)",
                r.get::<i64, _>("chunk_count"),
                r.get::<i64, _>("source_count"),
                format_ts_relative(r.get::<i64, _>("last_ingest"))
            );
        }
    }
    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
