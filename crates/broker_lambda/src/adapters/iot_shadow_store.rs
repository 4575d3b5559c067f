use async_trait::async_trait;
use aws_sdk_iotdataplane::config::http::HttpResponse;
use aws_sdk_iotdataplane::error::{DisplayErrorContext, SdkError};
use aws_sdk_iotdataplane::operation::update_thing_shadow::UpdateThingShadowError;
use aws_sdk_iotdataplane::primitives::Blob;
use serde_json::Value;

use crate::adapters::shadow_store::ShadowStore;
use crate::runtime::contract::Fields;
use crate::runtime::error::BrokerError;
use crate::runtime::identity::DeviceIdentity;
use crate::runtime::shadow::{wire_version, ShadowDocument, ShadowSection, ShadowUpdate};

const DATA_ENDPOINT_TYPE: &str = "iot:Data-ATS";

fn unavailable(operation: &str, error: &(impl std::error::Error + 'static)) -> BrokerError {
    BrokerError::StoreUnavailable(format!("{operation} failed: {}", DisplayErrorContext(error)))
}

pub fn data_endpoint_url(host: &str) -> String {
    format!("https://{host}")
}

/// The call was already accepted, so an unreadable payload is not retryable.
fn response_json(operation: &str, payload: Option<&Blob>) -> Result<Value, BrokerError> {
    let payload = payload.ok_or_else(|| {
        BrokerError::UnexpectedResponse(format!("{operation} returned no payload"))
    })?;
    serde_json::from_slice(payload.as_ref()).map_err(|error| {
        BrokerError::UnexpectedResponse(format!("{operation} returned malformed JSON: {error}"))
    })
}

/// Transport-level failures may follow an update the service already applied.
/// They surface as `Timeout`, which a shadow write never resends.
fn update_failure(error: SdkError<UpdateThingShadowError, HttpResponse>) -> BrokerError {
    match error {
        SdkError::TimeoutError(_) | SdkError::ResponseError(_) | SdkError::DispatchFailure(_) => {
            BrokerError::Timeout {
                operation: format!("update_thing_shadow ({})", DisplayErrorContext(&error)),
                timeout_ms: 0,
            }
        }
        error => {
            let error = error.into_service_error();
            if error.is_invalid_request_exception() {
                BrokerError::InvalidEvent(format!(
                    "shadow update rejected: {}",
                    DisplayErrorContext(&error)
                ))
            } else {
                unavailable("update_thing_shadow", &error)
            }
        }
    }
}

/// Classic device shadows in the IoT data plane. The service serializes
/// updates per thing and stamps each accepted update with the next version.
pub struct IotDataShadowStore {
    data_client: aws_sdk_iotdataplane::Client,
}

impl IotDataShadowStore {
    pub fn new(data_client: aws_sdk_iotdataplane::Client) -> Self {
        Self { data_client }
    }

    /// Builds the data-plane client against `endpoint`, or against the
    /// account's ATS data endpoint when none is configured.
    pub async fn connect(
        sdk_config: &aws_config::SdkConfig,
        iot_client: &aws_sdk_iot::Client,
        endpoint: Option<&str>,
    ) -> Result<Self, BrokerError> {
        let host = match endpoint {
            Some(host) => host.to_string(),
            None => iot_client
                .describe_endpoint()
                .endpoint_type(DATA_ENDPOINT_TYPE)
                .send()
                .await
                .map_err(|error| unavailable("describe_endpoint", &error.into_service_error()))?
                .endpoint_address()
                .map(str::to_string)
                .ok_or_else(|| {
                    BrokerError::StoreUnavailable(
                        "describe_endpoint returned no address".to_string(),
                    )
                })?,
        };

        let config = aws_sdk_iotdataplane::config::Builder::from(sdk_config)
            .endpoint_url(data_endpoint_url(&host))
            .build();
        Ok(Self::new(aws_sdk_iotdataplane::Client::from_conf(config)))
    }
}

#[async_trait]
impl ShadowStore for IotDataShadowStore {
    async fn update(
        &self,
        identity: &DeviceIdentity,
        section: ShadowSection,
        fields: &Fields,
    ) -> Result<u64, BrokerError> {
        let update = ShadowUpdate {
            section,
            fields: fields.clone(),
        };
        let body = serde_json::to_vec(&update.to_wire()).map_err(|error| {
            BrokerError::InvalidEvent(format!("shadow update is not serializable: {error}"))
        })?;

        let output = self
            .data_client
            .update_thing_shadow()
            .thing_name(identity.as_str())
            .payload(Blob::new(body))
            .send()
            .await
            .map_err(update_failure)?;

        let accepted = response_json("update_thing_shadow", output.payload())?;
        wire_version(&accepted).map_err(|error| {
            BrokerError::UnexpectedResponse(format!("update_thing_shadow: {error}"))
        })
    }

    async fn get(&self, identity: &DeviceIdentity) -> Result<Option<ShadowDocument>, BrokerError> {
        let output = match self
            .data_client
            .get_thing_shadow()
            .thing_name(identity.as_str())
            .send()
            .await
        {
            Ok(output) => output,
            Err(error) => {
                let error = error.into_service_error();
                if error.is_resource_not_found_exception() {
                    return Ok(None);
                }
                return Err(unavailable("get_thing_shadow", &error));
            }
        };

        let stored = response_json("get_thing_shadow", output.payload())?;
        ShadowDocument::from_wire(&stored)
            .map(Some)
            .map_err(|error| BrokerError::UnexpectedResponse(format!("get_thing_shadow: {error}")))
    }

    async fn delete(&self, identity: &DeviceIdentity) -> Result<(), BrokerError> {
        match self
            .data_client
            .delete_thing_shadow()
            .thing_name(identity.as_str())
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(error) => {
                let error = error.into_service_error();
                if error.is_resource_not_found_exception() {
                    Ok(())
                } else {
                    Err(unavailable("delete_thing_shadow", &error))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use broker_core::error::ErrorKind;
    use serde_json::json;

    use super::*;

    #[test]
    fn endpoint_host_becomes_https_url() {
        assert_eq!(
            data_endpoint_url("abc123-ats.iot.us-east-1.amazonaws.com"),
            "https://abc123-ats.iot.us-east-1.amazonaws.com"
        );
    }

    #[test]
    fn accepted_update_payload_yields_version() {
        let body = json!({
            "state": {"reported": {"Light": 250}},
            "metadata": {"reported": {"Light": {"timestamp": 1_700_000_000}}},
            "version": 4,
            "timestamp": 1_700_000_000
        });
        let blob = Blob::new(serde_json::to_vec(&body).expect("serialize"));
        let accepted = response_json("update_thing_shadow", Some(&blob)).expect("json");
        assert_eq!(wire_version(&accepted).expect("version"), 4);
    }

    #[test]
    fn unreadable_payload_is_not_retried() {
        let error = response_json("update_thing_shadow", None).expect_err("no payload");
        assert_eq!(error.kind(), ErrorKind::UnexpectedResponse);
        assert!(!error.is_retryable());

        let blob = Blob::new(b"not json".to_vec());
        let error = response_json("update_thing_shadow", Some(&blob)).expect_err("garbled");
        assert_eq!(error.kind(), ErrorKind::UnexpectedResponse);
    }

    #[test]
    fn ambiguous_update_failures_become_timeouts() {
        let error = update_failure(SdkError::timeout_error("read timed out"));
        assert_eq!(error.kind(), ErrorKind::Timeout);

        let error = update_failure(SdkError::construction_failure("bad request parameters"));
        assert_eq!(error.kind(), ErrorKind::StoreUnavailable);
    }
}
