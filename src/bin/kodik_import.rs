//! Mirror the Kodik catalog into the local materials table.
//!
//! ```text
//! kodik-import --max-pages 5 --translation-id 610 --translation-id 609
//! kodik-import --dry-run
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use akimori::{
    config::Config,
    db::{self, repositories::SqlxMaterialRepository},
    services::{ImportOptions, KodikClient, KodikImporter},
};

#[derive(Parser)]
#[command(name = "kodik-import")]
#[command(about = "Import or refresh the Kodik catalog mirror")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = "config.yml")]
    config: PathBuf,

    /// Stop after this many pages
    #[arg(long)]
    max_pages: Option<u32>,

    /// Fetch and count, store nothing
    #[arg(long)]
    dry_run: bool,

    /// Pause between pages in seconds (at least 0.5)
    #[arg(long)]
    sleep: Option<f64>,

    /// Only these translations; repeat the flag for several
    #[arg(long = "translation-id")]
    translation_ids: Vec<i64>,

    /// Request per-episode data
    #[arg(long)]
    with_episodes: bool,

    /// Skip materials blocked in this country (ISO code)
    #[arg(long)]
    not_blocked_in: Option<String>,

    /// API token, overrides the configuration
    #[arg(long)]
    token: Option<String>,
}

impl Cli {
    /// Fold the flags into the file/env configuration
    fn apply(&self, config: &mut Config) {
        let kodik = &mut config.kodik;
        if self.max_pages.is_some() {
            kodik.max_pages = self.max_pages;
        }
        if let Some(sleep) = self.sleep {
            kodik.sleep_seconds = sleep;
        }
        if !self.translation_ids.is_empty() {
            kodik.translation_ids = self.translation_ids.clone();
        }
        if self.with_episodes {
            kodik.with_episodes = true;
        }
        if let Some(country) = self.not_blocked_in.as_deref().filter(|c| !c.is_empty()) {
            kodik.not_blocked_in = Some(country.to_uppercase());
        }
        if let Some(token) = self.token.clone() {
            kodik.token = Some(token);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "akimori=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::load_with_env(&cli.config)?;
    cli.apply(&mut config);
    if config.kodik.token.as_deref().map_or(true, str::is_empty) {
        tracing::warn!("No Kodik token configured, requests will likely be rejected");
    }

    let pool = db::create_pool(&config.database).await?;
    db::migrations::run_migrations(&pool).await?;

    let mut options = ImportOptions::from_config(&config.kodik);
    options.dry_run = cli.dry_run;

    let client = KodikClient::new(config.kodik.clone())?;
    let importer = KodikImporter::new(client, SqlxMaterialRepository::boxed(pool), options);
    let stats = importer.run().await.context("Kodik import failed")?;

    println!(
        "pages={} processed={} created={} updated={} failed={}",
        stats.pages, stats.processed, stats.created, stats.updated, stats.failed
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "kodik-import",
            "--max-pages",
            "3",
            "--sleep",
            "2.5",
            "--translation-id",
            "610",
            "--translation-id",
            "609",
            "--not-blocked-in",
            "ru",
            "--dry-run",
        ]);
        assert!(cli.dry_run);

        let mut config = Config::default();
        cli.apply(&mut config);
        assert_eq!(config.kodik.max_pages, Some(3));
        assert_eq!(config.kodik.sleep_seconds, 2.5);
        assert_eq!(config.kodik.translation_ids, vec![610, 609]);
        assert_eq!(config.kodik.not_blocked_in.as_deref(), Some("RU"));
        assert!(!config.kodik.with_episodes);
    }

    #[test]
    fn test_defaults_keep_config() {
        let cli = Cli::parse_from(["kodik-import"]);
        let mut config = Config::default();
        let before = config.kodik.clone();
        cli.apply(&mut config);
        assert_eq!(config.kodik.max_pages, before.max_pages);
        assert_eq!(config.kodik.translation_ids, before.translation_ids);
        assert_eq!(cli.config, PathBuf::from("config.yml"));
    }
}
