use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use geocoding_cache::{
    distance_km, AddressQuery, AppConfig, CancellationToken, Coordinates, EnrichmentTarget,
    GeoServices, Resolution,
};
use parking_lot::Mutex;
use serde_json::json;

#[derive(Parser)]
#[command(name = "geocode", version, about = "Cached address geocoding")]
struct Cli {
    /// Directory holding the cache database.
    #[arg(long, env = "GEOCODING_DATA_DIR", default_value = ".")]
    data_dir: PathBuf,

    /// Overrides GEOCODING_MAX_RETRIES.
    #[arg(long)]
    max_retries: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Great-circle distance in kilometers.
    Distance {
        lat1: f64,
        lng1: f64,
        lat2: f64,
        lng2: f64,
    },
    #[command(flatten)]
    Cached(CachedCommand),
}

/// Commands that need the geocoding cache.
#[derive(Subcommand)]
enum CachedCommand {
    /// Resolve a postal address.
    Address {
        #[arg(long)]
        street: Option<String>,
        #[arg(long)]
        zip: Option<String>,
        #[arg(long)]
        city: Option<String>,
        #[arg(long, default_value = geocoding_cache::DEFAULT_COUNTRY)]
        country: String,
    },
    /// Resolve a provider place id.
    Place { place_id: String },
    /// Geocode rows of a SQLite table that have no coordinates yet.
    Enrich {
        #[arg(long)]
        database: PathBuf,
        #[arg(long)]
        table: String,
        #[arg(long = "where")]
        extra_where: Option<String>,
        /// Country code translation, e.g. `DE=Germany`. Repeatable.
        #[arg(long = "country-label", value_parser = parse_label)]
        country_labels: Vec<(String, String)>,
    },
    /// Remove expired cache entries.
    Purge,
}

fn parse_label(value: &str) -> Result<(String, String), String> {
    value
        .split_once('=')
        .map(|(code, label)| (code.trim().to_string(), label.trim().to_string()))
        .filter(|(code, label)| !code.is_empty() && !label.is_empty())
        .ok_or_else(|| format!("expected CODE=Label, got {value:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::from_env();
    if let Some(max_retries) = cli.max_retries {
        config.max_retries = max_retries;
    }

    match cli.command {
        Command::Distance {
            lat1,
            lng1,
            lat2,
            lng2,
        } => {
            let km = distance_km(&Coordinates::new(lat1, lng1), &Coordinates::new(lat2, lng2));
            println!("{}", json!({ "distanceKm": km }));
            Ok(())
        }
        Command::Cached(command) => {
            let services = GeoServices::initialize(&cli.data_dir, config)
                .context("failed to initialize geocoding services")?;
            run(&services, command).await
        }
    }
}

async fn run(services: &GeoServices, command: CachedCommand) -> Result<()> {
    match command {
        CachedCommand::Address {
            street,
            zip,
            city,
            country,
        } => {
            let query = AddressQuery {
                street,
                zip,
                city,
                country: Some(country),
            };
            let resolution = services.geocoder().resolve_address(&query).await?;
            print_resolution(&resolution)?;
        }
        CachedCommand::Place { place_id } => {
            let resolution = services.geocoder().resolve_by_place_id(&place_id).await?;
            print_resolution(&resolution)?;
        }
        CachedCommand::Enrich {
            database,
            table,
            extra_where,
            country_labels,
        } => {
            let connection = rusqlite::Connection::open(&database)
                .with_context(|| format!("failed to open {}", database.display()))?;
            let enricher = services
                .enricher(Arc::new(Mutex::new(connection)))
                .with_country_labels(country_labels.into_iter().collect::<HashMap<_, _>>());
            let mut target = EnrichmentTarget::new(table);
            target.extra_where = extra_where;
            let stats = enricher
                .enrich(&target, None, &CancellationToken::new())
                .await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        CachedCommand::Purge => {
            let removed = services.cache().purge_expired()?;
            println!("{}", json!({ "removed": removed }));
        }
    }
    Ok(())
}

fn print_resolution(resolution: &Resolution) -> Result<()> {
    let output = match resolution {
        Resolution::Found {
            coordinates,
            source,
        } => json!({
            "status": "found",
            "source": format!("{source:?}").to_lowercase(),
            "coordinates": coordinates,
        }),
        Resolution::Empty => json!({ "status": "empty" }),
        Resolution::RateLimited { attempts } => {
            return Err(anyhow!(
                "provider still rate limited after {attempts} attempt(s)"
            ))
        }
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_parses_without_cache_commands() {
        let cli = Cli::try_parse_from([
            "geocode", "distance", "48.8566", "2.3522", "51.5074", "-0.1278",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Distance { lat1, .. } if lat1 == 48.8566));
    }

    #[test]
    fn cache_commands_stay_top_level() {
        let cli = Cli::try_parse_from(["geocode", "address", "--city", "Berlin"]).unwrap();
        match cli.command {
            Command::Cached(CachedCommand::Address { city, country, .. }) => {
                assert_eq!(city.as_deref(), Some("Berlin"));
                assert_eq!(country, "Germany");
            }
            _ => panic!("expected the address command"),
        }

        let cli = Cli::try_parse_from([
            "geocode",
            "enrich",
            "--database",
            "stores.db",
            "--table",
            "stores",
            "--country-label",
            "DE=Germany",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Command::Cached(CachedCommand::Enrich { ref country_labels, .. })
                if country_labels == &[("DE".to_string(), "Germany".to_string())]
        ));
        assert!(Cli::try_parse_from(["geocode", "purge"]).is_ok());
    }

    #[test]
    fn country_labels_need_both_sides() {
        assert_eq!(
            parse_label(" AT = Austria "),
            Ok(("AT".to_string(), "Austria".to_string()))
        );
        assert!(parse_label("AT").is_err());
        assert!(parse_label("=Austria").is_err());
    }
}
