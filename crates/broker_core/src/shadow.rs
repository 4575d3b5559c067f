//! Device shadow documents: desired/reported state with a version counter.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::contract::Fields;
use crate::error::BrokerError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ShadowSection {
    Desired,
    Reported,
}

impl ShadowSection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Desired => "desired",
            Self::Reported => "reported",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ShadowDocument {
    pub desired: Fields,
    pub reported: Fields,
    pub version: u64,
}

impl ShadowDocument {
    pub fn section(&self, section: ShadowSection) -> &Fields {
        match section {
            ShadowSection::Desired => &self.desired,
            ShadowSection::Reported => &self.reported,
        }
    }

    /// Merges `fields` into `section` and bumps the version by one.
    ///
    /// Existing keys are overwritten; a JSON `null` removes the key.
    pub fn apply(&mut self, section: ShadowSection, fields: &Fields) -> u64 {
        let target = match section {
            ShadowSection::Desired => &mut self.desired,
            ShadowSection::Reported => &mut self.reported,
        };
        for (key, value) in fields {
            if value.is_null() {
                target.remove(key);
            } else {
                target.insert(key.clone(), value.clone());
            }
        }
        self.version += 1;
        self.version
    }

    /// Desired fields whose value differs from, or is missing in, reported.
    pub fn delta(&self) -> Fields {
        self.desired
            .iter()
            .filter(|(key, value)| self.reported.get(*key) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Renders the `{"state": {...}, "version": n}` response shape.
    pub fn to_wire(&self) -> Value {
        let mut state = Map::new();
        state.insert("desired".to_string(), fields_value(&self.desired));
        state.insert("reported".to_string(), fields_value(&self.reported));
        let delta = self.delta();
        if !delta.is_empty() {
            state.insert("delta".to_string(), fields_value(&delta));
        }
        json!({
            "state": Value::Object(state),
            "version": self.version,
        })
    }

    /// Reads a stored document back from the shadow service's response.
    /// Missing sections are empty; `delta` and `metadata` are derived data and
    /// ignored.
    pub fn from_wire(payload: &Value) -> Result<Self, BrokerError> {
        let state = match payload.get("state") {
            None | Some(Value::Null) => None,
            Some(Value::Object(state)) => Some(state),
            Some(_) => {
                return Err(BrokerError::InvalidEvent(
                    "shadow state must be a JSON object".to_string(),
                ))
            }
        };
        let section = |name: &str| -> Result<Fields, BrokerError> {
            match state.and_then(|state| state.get(name)) {
                None | Some(Value::Null) => Ok(Fields::new()),
                Some(Value::Object(fields)) => Ok(fields
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()),
                Some(_) => Err(BrokerError::InvalidEvent(format!(
                    "state.{name} must be a JSON object"
                ))),
            }
        };

        Ok(Self {
            desired: section("desired")?,
            reported: section("reported")?,
            version: wire_version(payload)?,
        })
    }
}

/// The `version` the shadow service stamped on an accepted update or a
/// stored document.
pub fn wire_version(payload: &Value) -> Result<u64, BrokerError> {
    payload
        .get("version")
        .and_then(Value::as_u64)
        .ok_or_else(|| {
            BrokerError::InvalidEvent("shadow payload carries no version".to_string())
        })
}

/// A single-section shadow update as carried on the wire:
/// `{"state": {"desired": {...}}}` or `{"state": {"reported": {...}}}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowUpdate {
    pub section: ShadowSection,
    pub fields: Fields,
}

impl ShadowUpdate {
    pub fn desired(fields: Fields) -> Self {
        Self {
            section: ShadowSection::Desired,
            fields,
        }
    }

    pub fn reported(fields: Fields) -> Self {
        Self {
            section: ShadowSection::Reported,
            fields,
        }
    }

    pub fn to_wire(&self) -> Value {
        json!({
            "state": {
                self.section.as_str(): fields_value(&self.fields),
            }
        })
    }

    pub fn from_wire(payload: &Value) -> Result<Self, BrokerError> {
        let state = payload
            .get("state")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                BrokerError::InvalidEvent("shadow update must carry a state object".to_string())
            })?;

        let mut sections = state.iter().filter(|(key, _)| {
            matches!(key.as_str(), "desired" | "reported")
        });
        let (Some((name, fields)), None) = (sections.next(), sections.next()) else {
            return Err(BrokerError::InvalidEvent(
                "shadow update must carry exactly one of state.desired or state.reported"
                    .to_string(),
            ));
        };

        let Some(fields) = fields.as_object() else {
            return Err(BrokerError::InvalidEvent(format!(
                "state.{name} must be a JSON object"
            )));
        };

        let section = if name == "desired" {
            ShadowSection::Desired
        } else {
            ShadowSection::Reported
        };
        Ok(Self {
            section,
            fields: fields
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        })
    }
}

fn fields_value(fields: &Fields) -> Value {
    Value::Object(
        fields
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    )
}
