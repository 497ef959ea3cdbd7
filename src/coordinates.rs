use serde::{Deserialize, Serialize};

/// A resolved position in decimal degrees. `long_name` is only filled for
/// lookups that went through a place id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_name: Option<String>,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            long_name: None,
        }
    }

    pub fn with_long_name(mut self, long_name: impl Into<String>) -> Self {
        self.long_name = Some(long_name.into());
        self
    }

    /// Batch tables use NULL or 0 for "not geocoded yet".
    pub fn is_unset(latitude: Option<f64>, longitude: Option<f64>) -> bool {
        let unset = |value: Option<f64>| value.map_or(true, |v| v == 0.0);
        unset(latitude) || unset(longitude)
    }
}
