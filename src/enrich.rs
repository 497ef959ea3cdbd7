use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, Connection};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use crate::address::AddressQuery;
use crate::coordinates::Coordinates;
use crate::distance::{validate_identifier, SqlDialect};
use crate::errors::{AppError, AppResult};
use crate::geocoder::{GeocodingClient, Resolution, ResolutionSource};

/// Table and column names of the records to enrich.
#[derive(Debug, Clone)]
pub struct EnrichmentTarget {
    pub table: String,
    pub uid_field: String,
    pub latitude_field: String,
    pub longitude_field: String,
    pub street_field: String,
    pub zip_field: String,
    pub city_field: String,
    pub country_field: String,
    /// Trusted SQL appended with `AND`; never build it from user input.
    pub extra_where: Option<String>,
}

impl EnrichmentTarget {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            uid_field: "uid".into(),
            latitude_field: "latitude".into(),
            longitude_field: "longitude".into(),
            street_field: "street".into(),
            zip_field: "zip".into(),
            city_field: "city".into(),
            country_field: "country".into(),
            extra_where: None,
        }
    }

    fn validate(&self) -> AppResult<()> {
        [
            &self.table,
            &self.uid_field,
            &self.latitude_field,
            &self.longitude_field,
            &self.street_field,
            &self.zip_field,
            &self.city_field,
            &self.country_field,
        ]
        .into_iter()
        .try_for_each(|identifier| validate_identifier(identifier))
    }

    fn quoted(&self, identifier: &str) -> String {
        SqlDialect::Sqlite.quote_identifier(identifier)
    }

    fn pending_rows_sql(&self) -> String {
        let lat = self.quoted(&self.latitude_field);
        let lng = self.quoted(&self.longitude_field);
        let mut sql = format!(
            "SELECT {uid}, {street}, {zip}, {city}, {country}
            FROM {table}
            WHERE ({lat} IS NULL OR {lat} = 0 OR {lng} IS NULL OR {lng} = 0)",
            uid = self.quoted(&self.uid_field),
            street = self.quoted(&self.street_field),
            zip = self.quoted(&self.zip_field),
            city = self.quoted(&self.city_field),
            country = self.quoted(&self.country_field),
            table = self.quoted(&self.table),
        );
        if let Some(clause) = self.extra_where.as_deref().map(str::trim) {
            if !clause.is_empty() {
                sql.push_str(&format!(" AND ({clause})"));
            }
        }
        sql.push_str(&format!(
            " ORDER BY {} ASC LIMIT ?1",
            self.quoted(&self.uid_field)
        ));
        sql
    }

    fn update_sql(&self) -> String {
        format!(
            "UPDATE {table} SET {lat} = ?1, {lng} = ?2 WHERE {uid} = ?3",
            table = self.quoted(&self.table),
            lat = self.quoted(&self.latitude_field),
            lng = self.quoted(&self.longitude_field),
            uid = self.quoted(&self.uid_field),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrichmentStats {
    pub total_rows: usize,
    pub cache_hits: usize,
    pub provider_calls: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub skipped: usize,
    pub rate_limited: usize,
}

#[derive(Debug, Clone)]
pub struct EnrichmentProgress {
    pub total_rows: usize,
    pub processed: usize,
    pub resolved: usize,
}

#[derive(Debug, Clone)]
struct PendingRow {
    uid: i64,
    street: Option<String>,
    zip: Option<String>,
    city: Option<String>,
    country: Option<String>,
}

/// Fills in coordinates for rows that have none, one provider call at a time.
pub struct BatchEnricher {
    db: Arc<Mutex<Connection>>,
    geocoder: GeocodingClient,
    country_labels: HashMap<String, String>,
    limit: usize,
    guard: Arc<AsyncMutex<()>>,
}

impl BatchEnricher {
    pub fn new(db: Arc<Mutex<Connection>>, geocoder: GeocodingClient, limit: usize) -> Self {
        Self {
            db,
            geocoder,
            country_labels: HashMap::new(),
            limit: limit.max(1),
            guard: Arc::new(AsyncMutex::new(())),
        }
    }

    /// Stored country codes are replaced by these labels before geocoding.
    pub fn with_country_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.country_labels = labels;
        self
    }

    pub async fn enrich(
        &self,
        target: &EnrichmentTarget,
        observer: Option<Arc<dyn Fn(EnrichmentProgress) + Send + Sync>>,
        cancel: &CancellationToken,
    ) -> AppResult<EnrichmentStats> {
        target.validate()?;
        let _lock = self.guard.lock().await;
        let rows = self.load_rows(target)?;

        let total_rows = rows.len();
        let mut stats = EnrichmentStats {
            total_rows,
            ..EnrichmentStats::default()
        };
        let mut processed = 0;
        for row in rows {
            if cancel.is_cancelled() {
                break;
            }
            if blank(&row.zip) && blank(&row.city) {
                stats.skipped += 1;
            } else {
                let query = self.query_for(&row);
                match self
                    .geocoder
                    .resolve_address_with_cancel(&query, cancel)
                    .await
                {
                    Ok(Resolution::Found {
                        coordinates,
                        source,
                    }) => {
                        match source {
                            ResolutionSource::Cache => stats.cache_hits += 1,
                            ResolutionSource::Provider => stats.provider_calls += 1,
                        }
                        self.store_coordinates(target, row.uid, &coordinates)?;
                        stats.resolved += 1;
                    }
                    Ok(Resolution::Empty) => {
                        stats.provider_calls += 1;
                        stats.unresolved += 1;
                    }
                    Ok(Resolution::RateLimited { attempts }) => {
                        warn!(
                            target: "enrichment",
                            uid = row.uid,
                            attempts,
                            "row left without coordinates; provider rate limited"
                        );
                        stats.provider_calls += 1;
                        stats.rate_limited += 1;
                        stats.unresolved += 1;
                    }
                    Err(AppError::Cancelled) => break,
                    Err(err) => return Err(err),
                }
            }
            processed += 1;
            if let Some(callback) = &observer {
                callback(EnrichmentProgress {
                    total_rows,
                    processed,
                    resolved: stats.resolved,
                });
            }
        }

        if processed < total_rows {
            stats.unresolved += total_rows - processed;
        }

        info!(
            target: "enrichment",
            table = %target.table,
            total = stats.total_rows,
            resolved = stats.resolved,
            unresolved = stats.unresolved,
            skipped = stats.skipped,
            "enrichment pass finished"
        );
        Ok(stats)
    }

    fn load_rows(&self, target: &EnrichmentTarget) -> AppResult<Vec<PendingRow>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&target.pending_rows_sql())?;
        let limit = i64::try_from(self.limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map([limit], |row| {
                Ok(PendingRow {
                    uid: row.get(0)?,
                    street: text_value(row.get(1)?),
                    zip: text_value(row.get(2)?),
                    city: text_value(row.get(3)?),
                    country: text_value(row.get(4)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn query_for(&self, row: &PendingRow) -> AddressQuery {
        let country = row.country.as_ref().map(|code| {
            self.country_labels
                .get(code.trim())
                .cloned()
                .unwrap_or_else(|| code.clone())
        });
        AddressQuery {
            street: row.street.clone(),
            zip: row.zip.clone(),
            city: row.city.clone(),
            country,
        }
    }

    fn store_coordinates(
        &self,
        target: &EnrichmentTarget,
        uid: i64,
        coordinates: &Coordinates,
    ) -> AppResult<()> {
        let conn = self.db.lock();
        conn.execute(
            &target.update_sql(),
            params![coordinates.latitude, coordinates.longitude, uid],
        )?;
        trace!(target: "enrichment", uid, "coordinates written back");
        Ok(())
    }
}

fn blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

/// Zip codes are frequently stored as integers.
fn text_value(value: Value) -> Option<String> {
    match value {
        Value::Text(text) => Some(text),
        Value::Integer(number) => Some(number.to_string()),
        Value::Real(number) => Some(number.to_string()),
        Value::Null | Value::Blob(_) => None,
    }
}
