//! The tally host telemetry agent and aggregation server.
//!
//! This library supports the `tally-agent` and `tally-server` binaries found
//! elsewhere in this project. The agent samples host and process counters and
//! delivers them over HTTP or gRPC; the server ingests, aggregates and
//! persists them. The bits and pieces here are not intended to be used
//! outside of supporting those binaries, although if they are helpful in
//! other domains that's a nice surprise.

#![deny(clippy::all)]
#![deny(clippy::perf)]
#![deny(clippy::suspicious)]
#![deny(clippy::complexity)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![allow(clippy::cast_precision_loss)]

use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::BoxBody};

pub mod agent;
pub(crate) mod codec;
pub mod config;
pub mod server;
pub mod service;
pub mod storage;

/// Box a complete in-memory body for a hyper request or response.
pub(crate) fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}
