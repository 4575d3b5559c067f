use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::contract::Fields;
use crate::error::BrokerError;

pub const DEFAULT_THRESHOLD_FIELD: &str = "Light";
pub const DEFAULT_THRESHOLD_VALUE: f64 = 200.0;
pub const DEFAULT_FLAG_FIELD: &str = "anomaly";

/// Raises `flag_field` when the numeric reading in `field` exceeds `threshold`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThresholdRule {
    pub field: String,
    pub threshold: f64,
    pub flag_field: String,
}

impl Default for ThresholdRule {
    fn default() -> Self {
        Self {
            field: DEFAULT_THRESHOLD_FIELD.to_string(),
            threshold: DEFAULT_THRESHOLD_VALUE,
            flag_field: DEFAULT_FLAG_FIELD.to_string(),
        }
    }
}

impl ThresholdRule {
    /// Returns 1 when the reading is strictly above the threshold, else 0.
    pub fn evaluate(&self, fields: &Fields) -> Result<u8, BrokerError> {
        let reading = fields.get(&self.field).ok_or_else(|| {
            BrokerError::InvalidEvent(format!("telemetry is missing field '{}'", self.field))
        })?;
        let Some(reading) = reading.as_f64() else {
            return Err(BrokerError::InvalidEvent(format!(
                "telemetry field '{}' must be numeric",
                self.field
            )));
        };
        Ok(u8::from(reading > self.threshold))
    }

    pub fn flag_fields(&self, flag: u8) -> Fields {
        Fields::from([(self.flag_field.clone(), Value::from(flag))])
    }
}
