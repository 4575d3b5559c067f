pub mod aws_iot;
pub mod certificate_authority;
pub mod device_registry;
pub mod iot_shadow_store;
pub mod policy_store;
pub mod shadow_store;
