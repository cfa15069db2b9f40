//! trestle: an HTTP/1.x transport.
//!
//! Two halves share one framing core:
//!
//! - [`server`]: an accept loop that drives each connection through the
//!   keep-alive request lifecycle, with hijacking, `Expect:
//!   100-continue` handling, and a background one-byte peek that
//!   observes client disconnects while a handler runs.
//! - [`client`]: a [`client::Transport`] that pools persistent
//!   connections, races dials against returning connections, and
//!   retries idempotent requests on stale keep-alives.
//!
//! Routing, cookies, and TLS implementations are collaborators, not
//! residents: handlers are a single trait, and TLS plugs in through the
//! seams in [`net`].

#![deny(rust_2018_idioms)]

pub use http::{header, HeaderMap, Method, StatusCode, Uri, Version};
pub use tokio_util::sync::CancellationToken;

mod body;
mod common;
pub mod client;
mod error;
mod headers;
mod hijack;
mod message;
pub mod net;
mod proto;
pub mod server;
mod sniff;

pub use crate::body::Body;
pub use crate::client::{RoundTripper, Transport};
pub use crate::error::{Error, Result};
pub use crate::hijack::Hijacked;
pub use crate::message::{GetBody, Request, RequestFacts, Response};
pub use crate::server::{AbortHandler, Handler, ResponseWriter, Server};
