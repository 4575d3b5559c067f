pub use broker_core::{config, contract, error, identity, policy, shadow, threshold};
