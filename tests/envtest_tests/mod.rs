//! Integration tests for lookups, the manager and the environment lifecycle
//!
//! # Test Organization
//!
//! - `lookups`: Stories about how each kind of failed lookup is classified
//!   against a real API server
//!
//! - `lifecycle`: Stories about starting and stopping the environment and the
//!   manager, including the full demo run
//!
//! # Running These Tests
//!
//! ```bash
//! KUBEBUILDER_ASSETS=/path/to/bin cargo test --test envtest -- --ignored --nocapture
//! ```

mod helpers;
mod lifecycle;
mod lookups;
