//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

/// Result type often returned from methods that can have trestle `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur handling HTTP streams.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    Parse(Parse),
    User(User),
    /// A message reached EOF, but is not complete.
    IncompleteMessage,
    /// A pending item was dropped before ever being processed.
    Canceled,
    /// A request was canceled while it was still waiting for a pooled
    /// or dialed connection.
    CanceledWaitingForConnection,
    /// Indicates a channel (client or body sender) is closed.
    ChannelClosed,
    /// An `io::Error` that occurred while trying to read or write to a network stream.
    Io,
    /// Error occurred while connecting.
    Connect,
    /// Error creating a TcpListener.
    Listen,
    /// Error accepting on a listener.
    Accept,
    /// Peer took too long to send headers.
    HeaderTimeout,
    /// A deadline elapsed.
    Timeout,
    /// Error while reading a body from connection.
    Body,
    /// Error while writing a body to connection.
    BodyWrite,
    /// The server closed a pooled connection before the request was sent.
    ServerClosedIdle,
    /// A request failed before any of its bytes reached the wire.
    NothingWritten,
    /// The server has been shut down.
    ServerClosed,
    /// Sentinel returned by an alternate-protocol round tripper to fall
    /// back to the plain HTTP transport.
    SkipAlternateProtocol,
}

#[derive(Debug)]
pub(crate) enum Parse {
    Method,
    Version,
    Uri,
    Host,
    Header,
    ContentLength,
    Status,
    TooLarge,
}

#[derive(Debug)]
pub(crate) enum User {
    /// Error from a user-supplied outgoing body reader.
    Body,
    /// A body was read after `close` was called on it.
    ReadAfterClose,
    /// The connection was hijacked and normal HTTP writes are gone.
    Hijacked,
    /// A handler wrote more bytes than its declared Content-Length.
    ContentLengthExceeded,
    /// A body was written for a status that does not allow one.
    BodyNotAllowed,
    /// A wrapped handler did not finish in time.
    HandlerTimeout,
    /// A request was issued with no usable host.
    MissingHost,
    /// A request was issued with an unsupported scheme.
    UnsupportedScheme,
    /// A request URI carried an invalid port.
    InvalidPort,
    /// A redirect response had no Location header.
    MissingLocation,
}

// Sentinel type to indicate the error was caused by a timeout.
#[derive(Debug)]
pub(crate) struct TimedOut;

impl Error {
    /// Returns true if this was an HTTP parse error.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if this was a parse error caused by a message that was too large.
    pub fn is_parse_too_large(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(Parse::TooLarge))
    }

    /// Returns true if this was a parse error caused by an invalid status line.
    pub fn is_parse_status(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(Parse::Status))
    }

    /// Returns true if this error was caused by user code.
    pub fn is_user(&self) -> bool {
        matches!(self.inner.kind, Kind::User(_))
    }

    /// Returns true if this was about a `Request` that was canceled.
    pub fn is_canceled(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::Canceled | Kind::CanceledWaitingForConnection
        )
    }

    /// Returns true if the request was canceled before a connection was obtained.
    pub fn is_canceled_waiting_for_connection(&self) -> bool {
        matches!(self.inner.kind, Kind::CanceledWaitingForConnection)
    }

    /// Returns true if a sender's channel is closed.
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::ChannelClosed)
    }

    /// Returns true if this was an error from connecting.
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::Connect)
    }

    /// Returns true if the connection closed before a message could complete.
    pub fn is_incomplete_message(&self) -> bool {
        matches!(self.inner.kind, Kind::IncompleteMessage)
    }

    /// Returns true if the error was caused by a timeout.
    pub fn is_timeout(&self) -> bool {
        if matches!(self.inner.kind, Kind::Timeout | Kind::HeaderTimeout) {
            return true;
        }
        self.find_source::<TimedOut>().is_some()
    }

    /// Returns true if a pooled connection was closed by the server
    /// before the request could be sent on it.
    pub fn is_server_closed_idle(&self) -> bool {
        matches!(self.inner.kind, Kind::ServerClosedIdle)
    }

    /// Returns true if the request failed before any bytes were written.
    pub fn is_nothing_written(&self) -> bool {
        matches!(self.inner.kind, Kind::NothingWritten)
    }

    /// Returns true if this is the alternate-protocol fall-through sentinel.
    pub fn is_skip_alternate_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::SkipAlternateProtocol)
    }

    /// Returns true if a body was read after it was closed.
    pub fn is_read_after_close(&self) -> bool {
        matches!(self.inner.kind, Kind::User(User::ReadAfterClose))
    }

    /// Returns true if the connection was hijacked out from under the writer.
    pub fn is_hijacked(&self) -> bool {
        matches!(self.inner.kind, Kind::User(User::Hijacked))
    }

    /// Returns true if a handler wrote past its declared Content-Length.
    pub fn is_content_length_exceeded(&self) -> bool {
        matches!(self.inner.kind, Kind::User(User::ContentLengthExceeded))
    }

    /// Returns true if the server was shut down while serving.
    pub fn is_server_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::ServerClosed)
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.inner.cause
    }

    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn find_source<E: StdError + 'static>(&self) -> Option<&E> {
        let mut cause = self.source();
        while let Some(err) = cause {
            if let Some(typed) = err.downcast_ref() {
                return Some(typed);
            }
            cause = err.source();
        }

        // else
        None
    }

    pub(crate) fn new_canceled() -> Error {
        Error::new(Kind::Canceled)
    }

    pub(crate) fn new_canceled_waiting() -> Error {
        Error::new(Kind::CanceledWaitingForConnection)
    }

    pub(crate) fn new_incomplete() -> Error {
        Error::new(Kind::IncompleteMessage)
    }

    pub(crate) fn new_too_large() -> Error {
        Error::new(Kind::Parse(Parse::TooLarge))
    }

    pub(crate) fn new_parse(parse: Parse) -> Error {
        Error::new(Kind::Parse(parse))
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_listen<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    pub(crate) fn new_accept<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Accept).with(cause)
    }

    pub(crate) fn new_connect<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Connect).with(cause)
    }

    pub(crate) fn new_closed() -> Error {
        Error::new(Kind::ChannelClosed)
    }

    pub(crate) fn new_body<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Body).with(cause)
    }

    pub(crate) fn new_body_write<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::BodyWrite).with(cause)
    }

    pub(crate) fn new_user_body<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::User(User::Body)).with(cause)
    }

    pub(crate) fn new_read_after_close() -> Error {
        Error::new(Kind::User(User::ReadAfterClose))
    }

    pub(crate) fn new_hijacked() -> Error {
        Error::new(Kind::User(User::Hijacked))
    }

    pub(crate) fn new_content_length_exceeded() -> Error {
        Error::new(Kind::User(User::ContentLengthExceeded))
    }

    pub(crate) fn new_body_not_allowed() -> Error {
        Error::new(Kind::User(User::BodyNotAllowed))
    }

    /// An error a timeout-wrapping handler can surface when the wrapped
    /// handler did not finish in time.
    pub fn handler_timeout() -> Error {
        Error::new(Kind::User(User::HandlerTimeout))
    }

    pub(crate) fn new_missing_host() -> Error {
        Error::new(Kind::User(User::MissingHost))
    }

    pub(crate) fn new_unsupported_scheme() -> Error {
        Error::new(Kind::User(User::UnsupportedScheme))
    }

    pub(crate) fn new_invalid_port() -> Error {
        Error::new(Kind::User(User::InvalidPort))
    }

    pub(crate) fn new_missing_location() -> Error {
        Error::new(Kind::User(User::MissingLocation))
    }

    pub(crate) fn new_header_timeout() -> Error {
        Error::new(Kind::HeaderTimeout)
    }

    pub(crate) fn new_timeout() -> Error {
        Error::new(Kind::Timeout).with(TimedOut)
    }

    pub(crate) fn new_server_closed_idle() -> Error {
        Error::new(Kind::ServerClosedIdle)
    }

    pub(crate) fn new_nothing_written<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::NothingWritten).with(cause)
    }

    pub(crate) fn new_server_closed() -> Error {
        Error::new(Kind::ServerClosed)
    }

    /// The sentinel an alternate-protocol round tripper returns to fall
    /// back to the plain HTTP transport.
    pub fn skip_alternate_protocol() -> Error {
        Error::new(Kind::SkipAlternateProtocol)
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::Method) => "invalid HTTP method parsed",
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed",
            Kind::Parse(Parse::Uri) => "invalid URI",
            Kind::Parse(Parse::Host) => "invalid Host header",
            Kind::Parse(Parse::Header) => "invalid HTTP header parsed",
            Kind::Parse(Parse::ContentLength) => "invalid content-length parsed",
            Kind::Parse(Parse::Status) => "invalid HTTP status-code parsed",
            Kind::Parse(Parse::TooLarge) => "message head is too large",
            Kind::IncompleteMessage => "connection closed before message completed",
            Kind::Canceled => "operation was canceled",
            Kind::CanceledWaitingForConnection => {
                "request canceled while waiting for connection"
            }
            Kind::ChannelClosed => "channel closed",
            Kind::Io => "connection error",
            Kind::Connect => "error trying to connect",
            Kind::Listen => "error creating server listener",
            Kind::Accept => "error accepting connection",
            Kind::HeaderTimeout => "read header from client timeout",
            Kind::Timeout => "operation timed out",
            Kind::Body => "error reading a body from connection",
            Kind::BodyWrite => "error writing a body to connection",
            Kind::ServerClosedIdle => "server closed idle connection",
            Kind::NothingWritten => "error before any bytes were written",
            Kind::ServerClosed => "server is shutting down",
            Kind::SkipAlternateProtocol => "skip alternate protocol",
            Kind::User(User::Body) => "error from user's outgoing body",
            Kind::User(User::ReadAfterClose) => "body read after close",
            Kind::User(User::Hijacked) => "connection has been hijacked",
            Kind::User(User::ContentLengthExceeded) => {
                "wrote more bytes than declared Content-Length"
            }
            Kind::User(User::BodyNotAllowed) => "request method or response status code does not allow body",
            Kind::User(User::HandlerTimeout) => "handler timed out",
            Kind::User(User::MissingHost) => "no host in request URL",
            Kind::User(User::UnsupportedScheme) => "unsupported URL scheme",
            Kind::User(User::InvalidPort) => "invalid port in URL",
            Kind::User(User::MissingLocation) => "response missing Location header",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("trestle::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<httparse::Error> for Error {
    fn from(err: httparse::Error) -> Error {
        let parse = match err {
            httparse::Error::HeaderName
            | httparse::Error::HeaderValue
            | httparse::Error::NewLine
            | httparse::Error::Token => Parse::Header,
            httparse::Error::Status => Parse::Status,
            httparse::Error::TooManyHeaders => Parse::TooLarge,
            httparse::Error::Version => Parse::Version,
        };
        Error::new(Kind::Parse(parse)).with(err)
    }
}

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation timed out")
    }
}

impl StdError for TimedOut {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn error_size_of() {
        assert_eq!(mem::size_of::<Error>(), mem::size_of::<usize>());
    }

    #[test]
    fn timeout_predicates() {
        assert!(Error::new_timeout().is_timeout());
        assert!(Error::new_header_timeout().is_timeout());
        assert!(Error::new_io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            TimedOut,
        ))
        .is_timeout());
        assert!(!Error::new_canceled().is_timeout());
    }

    #[test]
    fn canceled_covers_waiting() {
        assert!(Error::new_canceled_waiting().is_canceled());
        assert!(Error::new_canceled_waiting().is_canceled_waiting_for_connection());
        assert!(!Error::new_canceled().is_canceled_waiting_for_connection());
    }
}
