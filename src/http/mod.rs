//! HTTP subsystem
//!
//! Owned request/response types, strict HTTP/1.1 framing, request
//! rewriting and the per-device reverse proxy. The framing code is shared
//! by the TCP side (proxy) and the USB side (transport): both must agree
//! exactly on where a message ends.

pub mod message;
pub mod parse;
pub mod proxy;
pub mod rewrite;

pub use message::{Body, HeaderMap, Request, Response, Version};

use std::future::Future;

use crate::err::Result;

/// The capability to perform one HTTP transaction against the device and
/// return its response with a streaming body. The USB transport provides
/// it; the proxy and the IPP/eSCL probes consume it; tests substitute a
/// fake.
pub trait RoundTripper: Send + Sync + 'static {
    fn round_trip(&self, request: Request) -> impl Future<Output = Result<Response>> + Send;
}

impl<T: RoundTripper> RoundTripper for std::sync::Arc<T> {
    fn round_trip(&self, request: Request) -> impl Future<Output = Result<Response>> + Send {
        (**self).round_trip(request)
    }
}
