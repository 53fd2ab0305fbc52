//! Integration tests for the kubeaccess operator
//!
//! These tests need a kind cluster and tell the story of how cluster
//! administrators hand out access with AccessRequests.
//!
//! # Test Organization
//!
//! - `crd_operations`: creating and reading AccessRequests through the API,
//!   including the status subresource the controller writes
//!
//! - `access_flow`: the controllers running against a real API server and
//!   the cluster's own client-certificate signer
//!
//! # Running These Tests
//!
//! ```bash
//! cargo test --test kind -- --ignored
//!
//! # Only the provisioning flow, with output
//! cargo test --test kind access_flow -- --ignored --nocapture
//! ```

mod access_flow;
mod crd_operations;
mod helpers;
