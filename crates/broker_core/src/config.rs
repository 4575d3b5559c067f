use std::time::Duration;

use crate::policy::{default_policy_template, PolicyDocument, DEFAULT_POLICY_NAME};
use crate::threshold::{
    ThresholdRule, DEFAULT_FLAG_FIELD, DEFAULT_THRESHOLD_FIELD, DEFAULT_THRESHOLD_VALUE,
};

pub const DEFAULT_THING_TYPE_NAME: &str = "microchip-zero-touch-kit";
pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const MAX_ATTEMPTS_LIMIT: u32 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    pub thing_type_name: String,
    pub policy_name: String,
    pub policy_template: PolicyDocument,
    pub region: String,
    pub threshold_rule: ThresholdRule,
    pub notification_device: Option<String>,
    pub mirror_reported: bool,
    pub call_timeout: Duration,
    pub max_attempts: u32,
    /// Device data endpoint host; discovered from the control plane when unset.
    pub iot_data_endpoint: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            thing_type_name: DEFAULT_THING_TYPE_NAME.to_string(),
            policy_name: DEFAULT_POLICY_NAME.to_string(),
            policy_template: default_policy_template(),
            region: DEFAULT_REGION.to_string(),
            threshold_rule: ThresholdRule::default(),
            notification_device: None,
            mirror_reported: false,
            call_timeout: Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            iot_data_endpoint: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ValidationError {}

impl BrokerConfig {
    pub fn from_env() -> Result<Self, ValidationError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from a variable lookup, applying defaults for
    /// unset or blank variables.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ValidationError> {
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let thing_type_name =
            read("BROKER_THING_TYPE_NAME").unwrap_or_else(|| DEFAULT_THING_TYPE_NAME.to_string());
        let policy_name =
            read("BROKER_POLICY_NAME").unwrap_or_else(|| DEFAULT_POLICY_NAME.to_string());

        let policy_template = match read("BROKER_POLICY_TEMPLATE") {
            Some(text) => {
                let template = PolicyDocument::from_json(&text).map_err(|error| {
                    ValidationError::new(format!("BROKER_POLICY_TEMPLATE is invalid: {error}"))
                })?;
                if template.statement.is_empty() {
                    return Err(ValidationError::new(
                        "BROKER_POLICY_TEMPLATE must contain at least one statement",
                    ));
                }
                template
            }
            None => default_policy_template(),
        };

        let region = read("AWS_REGION")
            .or_else(|| read("AWS_DEFAULT_REGION"))
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        let threshold = match read("BROKER_THRESHOLD_VALUE") {
            Some(text) => text.parse::<f64>().ok().filter(|value| value.is_finite()).ok_or_else(
                || ValidationError::new("BROKER_THRESHOLD_VALUE must be a finite number"),
            )?,
            None => DEFAULT_THRESHOLD_VALUE,
        };

        let threshold_rule = ThresholdRule {
            field: read("BROKER_THRESHOLD_FIELD")
                .unwrap_or_else(|| DEFAULT_THRESHOLD_FIELD.to_string()),
            threshold,
            flag_field: read("BROKER_FLAG_FIELD").unwrap_or_else(|| DEFAULT_FLAG_FIELD.to_string()),
        };

        let mirror_reported = match read("BROKER_MIRROR_REPORTED").as_deref() {
            None => false,
            Some("1" | "true" | "TRUE" | "yes") => true,
            Some("0" | "false" | "FALSE" | "no") => false,
            Some(other) => {
                return Err(ValidationError::new(format!(
                    "BROKER_MIRROR_REPORTED must be a boolean, got '{other}'"
                )))
            }
        };

        let call_timeout_ms = match read("BROKER_CALL_TIMEOUT_MS") {
            Some(text) => text
                .parse::<u64>()
                .ok()
                .filter(|value| *value > 0)
                .ok_or_else(|| {
                    ValidationError::new("BROKER_CALL_TIMEOUT_MS must be a positive integer")
                })?,
            None => DEFAULT_CALL_TIMEOUT_MS,
        };

        let max_attempts = match read("BROKER_MAX_ATTEMPTS") {
            Some(text) => text
                .parse::<u32>()
                .ok()
                .filter(|value| (1..=MAX_ATTEMPTS_LIMIT).contains(value))
                .ok_or_else(|| {
                    ValidationError::new(format!(
                        "BROKER_MAX_ATTEMPTS must be between 1 and {MAX_ATTEMPTS_LIMIT}"
                    ))
                })?,
            None => DEFAULT_MAX_ATTEMPTS,
        };

        Ok(Self {
            thing_type_name,
            policy_name,
            policy_template,
            region,
            threshold_rule,
            notification_device: read("BROKER_NOTIFICATION_DEVICE"),
            mirror_reported,
            call_timeout: Duration::from_millis(call_timeout_ms),
            max_attempts,
            iot_data_endpoint: read("BROKER_IOT_DATA_ENDPOINT").map(|endpoint| {
                endpoint
                    .trim_start_matches("https://")
                    .trim_end_matches('/')
                    .to_string()
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_match_zero_touch_deployment() {
        let config = BrokerConfig::from_lookup(lookup(&[])).expect("defaults are valid");
        assert_eq!(config, BrokerConfig::default());
        assert_eq!(config.thing_type_name, "microchip-zero-touch-kit");
        assert_eq!(config.policy_name, "zt_policy");
        assert_eq!(config.threshold_rule.field, "Light");
        assert_eq!(config.threshold_rule.threshold, 200.0);
        assert_eq!(config.call_timeout, Duration::from_secs(5));
    }

    #[test]
    fn reads_overrides_and_prefers_aws_region() {
        let config = BrokerConfig::from_lookup(lookup(&[
            ("BROKER_THING_TYPE_NAME", "lab-sensor"),
            ("BROKER_THRESHOLD_FIELD", "Temp"),
            ("BROKER_THRESHOLD_VALUE", "31.5"),
            ("BROKER_FLAG_FIELD", "overheat"),
            ("BROKER_NOTIFICATION_DEVICE", "notificationThingName"),
            ("BROKER_MIRROR_REPORTED", "true"),
            ("BROKER_CALL_TIMEOUT_MS", "750"),
            ("BROKER_MAX_ATTEMPTS", "5"),
            ("AWS_REGION", "us-east-2"),
            ("AWS_DEFAULT_REGION", "eu-west-1"),
        ]))
        .expect("overrides are valid");

        assert_eq!(config.thing_type_name, "lab-sensor");
        assert_eq!(config.threshold_rule.field, "Temp");
        assert_eq!(config.threshold_rule.threshold, 31.5);
        assert_eq!(config.threshold_rule.flag_field, "overheat");
        assert_eq!(
            config.notification_device.as_deref(),
            Some("notificationThingName")
        );
        assert!(config.mirror_reported);
        assert_eq!(config.call_timeout, Duration::from_millis(750));
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.region, "us-east-2");
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = BrokerConfig::from_lookup(lookup(&[("BROKER_POLICY_NAME", "  ")]))
            .expect("blank is treated as unset");
        assert_eq!(config.policy_name, "zt_policy");
    }

    #[test]
    fn rejects_invalid_numbers() {
        let error = BrokerConfig::from_lookup(lookup(&[("BROKER_THRESHOLD_VALUE", "bright")]))
            .expect_err("non-numeric threshold should fail");
        assert_eq!(error.message(), "BROKER_THRESHOLD_VALUE must be a finite number");

        let error = BrokerConfig::from_lookup(lookup(&[("BROKER_CALL_TIMEOUT_MS", "0")]))
            .expect_err("zero timeout should fail");
        assert_eq!(
            error.message(),
            "BROKER_CALL_TIMEOUT_MS must be a positive integer"
        );

        let error = BrokerConfig::from_lookup(lookup(&[("BROKER_MAX_ATTEMPTS", "11")]))
            .expect_err("too many attempts should fail");
        assert_eq!(error.message(), "BROKER_MAX_ATTEMPTS must be between 1 and 10");
    }

    #[test]
    fn parses_custom_policy_template() {
        let template = r#"{
            "Version": "2012-10-17",
            "Statement": [
                {"Effect": "Deny", "Action": ["iot:Publish"], "Resource": ["arn:aws:iot:${region}:${accountId}:topic/blocked"]}
            ]
        }"#;
        let config = BrokerConfig::from_lookup(lookup(&[("BROKER_POLICY_TEMPLATE", template)]))
            .expect("template is valid");
        assert_eq!(config.policy_template.statement.len(), 1);

        let error = BrokerConfig::from_lookup(lookup(&[(
            "BROKER_POLICY_TEMPLATE",
            r#"{"Version": "2012-10-17", "Statement": []}"#,
        )]))
        .expect_err("empty statements should fail");
        assert_eq!(
            error.message(),
            "BROKER_POLICY_TEMPLATE must contain at least one statement"
        );
    }

    #[test]
    fn data_endpoint_is_stored_as_bare_host() {
        let config = BrokerConfig::from_lookup(lookup(&[(
            "BROKER_IOT_DATA_ENDPOINT",
            " https://abc123-ats.iot.us-east-1.amazonaws.com/ ",
        )]))
        .expect("endpoint is valid");
        assert_eq!(
            config.iot_data_endpoint.as_deref(),
            Some("abc123-ats.iot.us-east-1.amazonaws.com")
        );
        assert_eq!(
            BrokerConfig::from_lookup(lookup(&[])).expect("defaults").iot_data_endpoint,
            None
        );
    }
}
