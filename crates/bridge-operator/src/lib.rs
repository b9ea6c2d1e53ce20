//! Operator hosting the BridgeJob controller

#![deny(missing_docs)]

/// Controller runner - builds the BridgeJob controller future
pub mod controller_runner;
/// CRD installation on startup
pub mod crds;
