//! integration-tester - a test driver for Kubernetes controllers
//!
//! Test documents interleave Kubernetes object definitions with policy
//! checks written in Rego. The driver applies each object to a live
//! cluster, mirrors the resulting resources into the policy data
//! document, and repeatedly evaluates each check until it passes, skips,
//! or times out. Everything the driver created is garbage-collected at
//! the end of the run.
//!
//! # Modules
//!
//! - [`document`] - fragment splitting and classification
//! - [`yaml`] - anchor-aware YAML node trees
//! - [`fixture`] - reusable object templates
//! - [`hydrate`] - run environment and object hydration
//! - [`cluster`] - Kubernetes discovery, apply/delete, and informers
//! - [`policy`] - policy compilation and evaluation
//! - [`runner`] - the apply/watch/check state machine
//! - [`report`] - hierarchical result recording and output formats
//! - [`cli`] - the command line surface
//! - [`error`] - error types for the driver

#![deny(missing_docs)]

pub mod cli;
pub mod cluster;
pub mod document;
pub mod error;
pub mod fixture;
pub mod hydrate;
pub mod policy;
pub mod report;
pub mod runner;
pub mod yaml;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// The program name, also the value of the managed-by label on every
/// object the driver creates.
pub const PROGNAME: &str = "integration-tester";

/// Label key marking an object as managed by the test driver.
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Annotation key carrying the unique ID of the test run that created an
/// object.
pub const ANNOTATION_RUN_ID: &str = "integration-tester/run-id";
