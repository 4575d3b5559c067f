//! Access policy documents and template resolution.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::BrokerError;

pub const DEFAULT_POLICY_NAME: &str = "zt_policy";
pub const POLICY_DOCUMENT_VERSION: &str = "2012-10-17";
pub const STORED_POLICY_VERSION: &str = "1";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Effect {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Statement {
    pub effect: Effect,
    #[serde(deserialize_with = "one_or_many")]
    pub action: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub resource: Vec<String>,
}

/// IoT policy grammar allows `Action` and `Resource` to be a bare string.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
    pub version: String,
    pub statement: Vec<Statement>,
}

impl PolicyDocument {
    pub fn from_json(text: &str) -> Result<Self, BrokerError> {
        serde_json::from_str(text)
            .map_err(|error| BrokerError::InvalidEvent(format!("malformed policy document: {error}")))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("policy document should serialize")
    }

    /// Substitutes `${key}` placeholders with values from `params`.
    ///
    /// Placeholders without a matching parameter are kept verbatim so runtime
    /// policy variables such as `${iot:Connection.Thing.ThingName}` survive.
    pub fn resolve(&self, params: &PolicyParams) -> PolicyDocument {
        let values = params.substitutions();
        PolicyDocument {
            version: self.version.clone(),
            statement: self
                .statement
                .iter()
                .map(|statement| Statement {
                    effect: statement.effect,
                    action: statement.action.clone(),
                    resource: statement
                        .resource
                        .iter()
                        .map(|pattern| substitute(pattern, &values))
                        .collect(),
                })
                .collect(),
        }
    }
}

/// Parameters resolved into a policy template at creation time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyParams {
    pub region: Option<String>,
    pub account_id: Option<String>,
    pub thing_name: Option<String>,
}

impl PolicyParams {
    pub fn for_account(region: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            region: Some(region.into()),
            account_id: Some(account_id.into()),
            thing_name: None,
        }
    }

    fn substitutions(&self) -> BTreeMap<&'static str, &str> {
        let mut values = BTreeMap::new();
        if let Some(region) = self.region.as_deref() {
            values.insert("region", region);
        }
        if let Some(account_id) = self.account_id.as_deref() {
            values.insert("accountId", account_id);
            values.insert("account_id", account_id);
        }
        if let Some(thing_name) = self.thing_name.as_deref() {
            values.insert("ThingName", thing_name);
        }
        values
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Policy {
    pub name: String,
    pub version: String,
    pub document: PolicyDocument,
}

fn substitute(pattern: &str, values: &BTreeMap<&'static str, &str>) -> String {
    let mut resolved = String::with_capacity(pattern.len());
    let mut rest = pattern;
    while let Some(start) = rest.find("${") {
        resolved.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find('}') else {
            resolved.push_str(&rest[start..]);
            return resolved;
        };
        let key = &after_open[..end];
        match values.get(key) {
            Some(value) => resolved.push_str(value),
            None => resolved.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &after_open[end + 1..];
    }
    resolved.push_str(rest);
    resolved
}

fn allow(actions: &[&str], resources: &[&str]) -> Statement {
    Statement {
        effect: Effect::Allow,
        action: actions.iter().map(|action| action.to_string()).collect(),
        resource: resources
            .iter()
            .map(|resource| resource.to_string())
            .collect(),
    }
}

/// Zero-touch provisioning template: each device may only connect as itself
/// and use its own topics and shadow.
pub fn default_policy_template() -> PolicyDocument {
    const ARN: &str = "arn:aws:iot:${region}:${accountId}";
    let client = format!("{ARN}:client/${{iot:Connection.Thing.ThingName}}");
    let topic = format!("{ARN}:topic/${{iot:Connection.Thing.ThingName}}/*");
    let shadow_topic = format!("{ARN}:topic/$aws/things/${{iot:Connection.Thing.ThingName}}/shadow/*");
    let topic_filter = format!("{ARN}:topicfilter/${{iot:Connection.Thing.ThingName}}/#");
    let shadow_filter =
        format!("{ARN}:topicfilter/$aws/things/${{iot:Connection.Thing.ThingName}}/shadow/*");

    PolicyDocument {
        version: POLICY_DOCUMENT_VERSION.to_string(),
        statement: vec![
            allow(&["iot:Connect"], &[client.as_str()]),
            allow(&["iot:Publish", "iot:Receive"], &[topic.as_str(), shadow_topic.as_str()]),
            allow(&["iot:Subscribe"], &[topic_filter.as_str(), shadow_filter.as_str()]),
            allow(
                &["iot:UpdateThingShadow", "iot:GetThingShadow"],
                &[shadow_topic.as_str()],
            ),
        ],
    }
}
