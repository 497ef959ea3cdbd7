use std::f64::consts::PI;

use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;

use crate::coordinates::Coordinates;
use crate::errors::{AppError, AppResult};

/// Equatorial radius; every distance in this crate is computed against it.
pub const EARTH_RADIUS_KM: f64 = 6378.1;

const DEG_TO_RAD: f64 = PI / 180.0;

/// Great-circle distance via the haversine formula.
pub fn distance_km(a: &Coordinates, b: &Coordinates) -> f64 {
    let lat1 = a.latitude * DEG_TO_RAD;
    let lng1 = a.longitude * DEG_TO_RAD;
    let lat2 = b.latitude * DEG_TO_RAD;
    let lng2 = b.longitude * DEG_TO_RAD;

    let delta_lat = lat2 - lat1;
    let delta_lng = lng2 - lng1;
    let h = (delta_lat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (delta_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Spherical law of cosines, exactly as emitted by [`build_radius_predicate`].
/// The arccos argument is clamped, so identical points give 0 instead of NaN.
pub fn spherical_distance_km(a: &Coordinates, b: &Coordinates) -> f64 {
    let lat1 = a.latitude * DEG_TO_RAD;
    let lat2 = b.latitude * DEG_TO_RAD;
    let delta_lng = a.longitude * DEG_TO_RAD - b.longitude * DEG_TO_RAD;
    let cosine = lat1.sin() * lat2.sin() + lat1.cos() * lat2.cos() * delta_lng.cos();
    cosine.clamp(-1.0, 1.0).acos() * EARTH_RADIUS_KM
}

pub trait Locatable {
    fn position(&self) -> Coordinates;
}

impl Locatable for Coordinates {
    fn position(&self) -> Coordinates {
        self.clone()
    }
}

/// In-memory counterpart of the SQL radius query: items strictly closer than
/// `max_km`, nearest first.
pub fn within_radius<'a, T: Locatable>(
    center: &Coordinates,
    max_km: f64,
    items: &'a [T],
) -> Vec<(&'a T, f64)> {
    let mut hits: Vec<(&T, f64)> = items
        .iter()
        .map(|item| (item, spherical_distance_km(&item.position(), center)))
        .filter(|(_, distance)| *distance < max_km)
        .collect();
    hits.sort_by(|a, b| a.1.total_cmp(&b.1));
    hits
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SqlDialect {
    #[default]
    Sqlite,
    MySql,
    Postgres,
}

impl SqlDialect {
    pub(crate) fn quote_identifier(&self, identifier: &str) -> String {
        let quote = match self {
            SqlDialect::Sqlite | SqlDialect::Postgres => '"',
            SqlDialect::MySql => '`',
        };
        identifier
            .split('.')
            .map(|part| format!("{quote}{part}{quote}"))
            .collect::<Vec<_>>()
            .join(".")
    }

    fn clamp_unit(&self, expression: &str) -> String {
        match self {
            SqlDialect::Sqlite => format!("MIN(1.0, MAX(-1.0, {expression}))"),
            SqlDialect::MySql | SqlDialect::Postgres => {
                format!("LEAST(1.0, GREATEST(-1.0, {expression}))")
            }
        }
    }

    /// Postgres wants numbered `$n` placeholders; the others take `?` as is.
    fn number_placeholders(&self, sql: String) -> String {
        match self {
            SqlDialect::Postgres => {
                let mut numbered = String::with_capacity(sql.len() + 8);
                let mut index = 0;
                for c in sql.chars() {
                    if c == '?' {
                        index += 1;
                        numbered.push_str(&format!("${index}"));
                    } else {
                        numbered.push(c);
                    }
                }
                numbered
            }
            SqlDialect::Sqlite | SqlDialect::MySql => sql,
        }
    }
}

/// SQL fragments for "rows within `max_km` of a point". Center coordinates
/// and the radius are bound as `?` parameters; nothing numeric is inlined.
/// [`RadiusPredicate::select_sql`] renders the dialect's own placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct RadiusPredicate {
    pub dialect: SqlDialect,
    /// Binds `[center_lat, center_lat, center_lng]`.
    pub distance_expression: String,
    /// Binds `[center_lat, center_lat, center_lng, max_km]`.
    pub where_clause: String,
    pub order_by: String,
    pub params: Vec<f64>,
    center: Coordinates,
    max_km: f64,
}

impl RadiusPredicate {
    pub fn distance_params(&self) -> [f64; 3] {
        [
            self.center.latitude,
            self.center.latitude,
            self.center.longitude,
        ]
    }

    pub fn max_km(&self) -> f64 {
        self.max_km
    }

    /// Full statement selecting `fields` plus the computed `distance` column.
    /// Returns the SQL and its parameters in placeholder order.
    pub fn select_sql(&self, table: &str, fields: &[&str]) -> AppResult<(String, Vec<f64>)> {
        validate_identifier(table)?;
        let columns = if fields.is_empty() {
            "*".to_string()
        } else {
            fields
                .iter()
                .map(|field| {
                    validate_identifier(field)?;
                    Ok(self.dialect.quote_identifier(field))
                })
                .collect::<AppResult<Vec<_>>>()?
                .join(", ")
        };

        let sql = format!(
            "SELECT {columns}, {expr} AS {distance} FROM {table} WHERE {filter} ORDER BY {order}",
            expr = self.distance_expression,
            distance = self.dialect.quote_identifier("distance"),
            table = self.dialect.quote_identifier(table),
            filter = self.where_clause,
            order = self.order_by,
        );
        let mut params = self.distance_params().to_vec();
        params.extend_from_slice(&self.params);
        Ok((self.dialect.number_placeholders(sql), params))
    }
}

pub fn build_radius_predicate(
    dialect: SqlDialect,
    center: &Coordinates,
    max_km: f64,
    lat_field: &str,
    lng_field: &str,
) -> AppResult<RadiusPredicate> {
    validate_identifier(lat_field)?;
    validate_identifier(lng_field)?;
    if !max_km.is_finite() || !center.latitude.is_finite() || !center.longitude.is_finite() {
        return Err(AppError::Config(
            "radius search needs finite coordinates and distance".into(),
        ));
    }

    let lat = dialect.quote_identifier(lat_field);
    let lng = dialect.quote_identifier(lng_field);
    let cosine = format!(
        "SIN(RADIANS({lat})) * SIN(RADIANS(?)) + COS(RADIANS({lat})) * COS(RADIANS(?)) * COS(RADIANS({lng}) - RADIANS(?))"
    );
    let distance_expression = format!(
        "ACOS({}) * {EARTH_RADIUS_KM:?}",
        dialect.clamp_unit(&cosine)
    );
    let where_clause = format!("{distance_expression} < ?");
    let order_by = format!("{} ASC", dialect.quote_identifier("distance"));

    let params = vec![center.latitude, center.latitude, center.longitude, max_km];
    Ok(RadiusPredicate {
        dialect,
        distance_expression,
        where_clause,
        order_by,
        params,
        center: center.clone(),
        max_km,
    })
}

/// Installs `ACOS`, `RADIANS`, `SIN` and `COS` on a SQLite connection so
/// [`SqlDialect::Sqlite`] fragments run on builds without the math extension.
/// NULL arguments stay NULL.
pub fn register_math_functions(connection: &Connection) -> AppResult<()> {
    let functions: [(&str, fn(f64) -> f64); 4] = [
        ("ACOS", f64::acos),
        ("RADIANS", f64::to_radians),
        ("SIN", f64::sin),
        ("COS", f64::cos),
    ];
    for (name, function) in functions {
        connection.create_scalar_function(
            name,
            1,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            move |ctx| Ok(ctx.get::<Option<f64>>(0)?.map(function)),
        )?;
    }
    Ok(())
}

/// Plain or dotted (`schema.table`) SQL identifier.
pub(crate) fn validate_identifier(identifier: &str) -> AppResult<()> {
    let valid = !identifier.is_empty()
        && identifier.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(AppError::Config(format!(
            "invalid SQL identifier: {identifier:?}"
        )))
    }
}
