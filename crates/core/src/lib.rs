//! # playop-core
//!
//! Core types shared by every playop crate:
//!
//! - [`Error`]: typed, recoverable errors
//! - [`ResourceId`]: `(kind, namespace, name)` identity of a managed resource
//! - [`ParamValue`] / [`ParamSet`]: the closed set of parameter kinds a
//!   workflow may receive

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod id;
pub mod params;

pub use error::{Error, Result};
pub use id::ResourceId;
pub use params::{ParamSet, ParamValue};
