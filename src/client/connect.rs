//! Establishing new client connections: plain TCP, TLS, HTTP proxies
//! (absolute-form and CONNECT tunnels), and SOCKS5.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use bytes::BytesMut;
use http::header::{HeaderMap, HeaderValue, PROXY_AUTHORIZATION};
use http::{Method, StatusCode, Uri, Version};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use super::conn::PersistConn;
use super::{ConnectMethod, TransportInner};
use crate::common::with_deadline;
use crate::error::Error;
use crate::hijack::Hijacked;
use crate::net::{BoxedStream, TlsState};
use crate::proto::h1::parse;

/// Dials, tunnels, and handshakes a new connection for `cm`, then
/// spawns its loops.
pub(crate) async fn dial_conn(
    inner: &Arc<TransportInner>,
    cm: &ConnectMethod,
) -> crate::Result<Arc<PersistConn>> {
    let mut is_proxy = false;
    let mut tls_state: Option<TlsState> = None;

    let stream: BoxedStream = match &cm.proxy {
        None => inner.dialer.dial(&cm.addr).await?,
        Some(proxy) => {
            let proxy_addr = proxy_address(proxy)?;
            match proxy.scheme_str() {
                Some("socks5") => {
                    let stream = inner.dialer.dial(&proxy_addr).await?;
                    socks5_handshake(stream, &cm.addr, proxy_userinfo(proxy)).await?
                }
                _ => {
                    let stream = inner.dialer.dial(&proxy_addr).await?;
                    if cm.scheme == "https" {
                        connect_tunnel(inner, stream, cm, proxy).await?
                    } else {
                        // plain-HTTP proxying rewrites the request line
                        // instead of tunneling
                        is_proxy = true;
                        stream
                    }
                }
            }
        }
    };

    let stream = if cm.scheme == "https" {
        let tls = inner
            .tls
            .as_ref()
            .ok_or_else(|| Error::new_connect("no TLS connector configured"))?;
        let (stream, state) = with_deadline(
            Some(inner.tls_handshake_timeout),
            tls.connect(stream, &cm.host),
        )
        .await?;
        tls_state = Some(state);
        stream
    } else {
        stream
    };

    trace!("dialed new connection for {:?}", cm.key());
    Ok(PersistConn::spawn(
        stream,
        cm.key(),
        is_proxy,
        tls_state,
        inner.conn_params(),
    ))
}

fn proxy_address(proxy: &Uri) -> crate::Result<String> {
    let host = proxy
        .host()
        .ok_or_else(|| Error::new_connect("proxy URL has no host"))?;
    let port = proxy.port_u16().unwrap_or(match proxy.scheme_str() {
        Some("https") => 443,
        Some("socks5") => 1080,
        _ => 80,
    });
    Ok(format!("{}:{}", host, port))
}

fn proxy_userinfo(proxy: &Uri) -> Option<(String, String)> {
    let authority = proxy.authority()?.as_str();
    let creds = authority.rsplit_once('@')?.0;
    match creds.split_once(':') {
        Some((user, pass)) => Some((user.to_owned(), pass.to_owned())),
        None => Some((creds.to_owned(), String::new())),
    }
}

pub(crate) fn proxy_auth_header(proxy: &Uri) -> Option<HeaderValue> {
    let (user, pass) = proxy_userinfo(proxy)?;
    let token = BASE64_STANDARD.encode(format!("{}:{}", user, pass));
    HeaderValue::from_str(&format!("Basic {}", token)).ok()
}

/// Issues a CONNECT to the proxy and waits for its 200 before handing
/// the stream on to TLS. Extra bytes the proxy sent along are replayed.
async fn connect_tunnel(
    inner: &Arc<TransportInner>,
    mut stream: BoxedStream,
    cm: &ConnectMethod,
    proxy: &Uri,
) -> crate::Result<BoxedStream> {
    let mut headers: HeaderMap = inner.proxy_connect_headers.clone();
    if let Some(auth) = proxy_auth_header(proxy) {
        headers.insert(PROXY_AUTHORIZATION, auth);
    }
    let mut head = BytesMut::new();
    parse::encode_request_head(
        &Method::CONNECT,
        &cm.addr,
        Version::HTTP_11,
        &cm.addr,
        &headers,
        &mut head,
    );
    stream.write_all(&head).await.map_err(Error::new_connect)?;
    stream.flush().await.map_err(Error::new_connect)?;

    let mut buf = BytesMut::with_capacity(1024);
    let head = loop {
        if let Some(head) = parse::parse_response(&mut buf, 8192)? {
            break head;
        }
        let n = stream.read_buf(&mut buf).await.map_err(Error::new_connect)?;
        if n == 0 {
            return Err(Error::new_connect("proxy closed during CONNECT"));
        }
    };
    if head.status != StatusCode::OK {
        debug!("proxy refused CONNECT: {}", head.status);
        return Err(Error::new_connect(format!(
            "proxy refused CONNECT: {}",
            head.status
        )));
    }
    if buf.is_empty() {
        Ok(stream)
    } else {
        Ok(Box::new(Hijacked::new(stream, buf.freeze())))
    }
}

const SOCKS5_VERSION: u8 = 0x05;

/// RFC 1928 client handshake with optional RFC 1929 username/password.
async fn socks5_handshake(
    mut stream: BoxedStream,
    target: &str,
    auth: Option<(String, String)>,
) -> crate::Result<BoxedStream> {
    let (host, port) = crate::headers::split_host_port(target)
        .and_then(|(host, port)| Some((host, port?.parse::<u16>().ok()?)))
        .ok_or_else(|| Error::new_connect("invalid SOCKS5 target address"))?;

    // greeting
    let greeting: &[u8] = if auth.is_some() {
        &[SOCKS5_VERSION, 2, 0x00, 0x02]
    } else {
        &[SOCKS5_VERSION, 1, 0x00]
    };
    stream.write_all(greeting).await.map_err(Error::new_connect)?;
    let mut choice = [0u8; 2];
    stream
        .read_exact(&mut choice)
        .await
        .map_err(Error::new_connect)?;
    if choice[0] != SOCKS5_VERSION {
        return Err(Error::new_connect("SOCKS5 proxy sent bad version"));
    }
    match choice[1] {
        0x00 => {}
        0x02 => {
            let (user, pass) =
                auth.ok_or_else(|| Error::new_connect("SOCKS5 proxy requires authentication"))?;
            if user.len() > 255 || pass.len() > 255 {
                return Err(Error::new_connect("SOCKS5 credentials too long"));
            }
            let mut msg = Vec::with_capacity(3 + user.len() + pass.len());
            msg.push(0x01);
            msg.push(user.len() as u8);
            msg.extend_from_slice(user.as_bytes());
            msg.push(pass.len() as u8);
            msg.extend_from_slice(pass.as_bytes());
            stream.write_all(&msg).await.map_err(Error::new_connect)?;
            let mut status = [0u8; 2];
            stream
                .read_exact(&mut status)
                .await
                .map_err(Error::new_connect)?;
            if status[1] != 0x00 {
                return Err(Error::new_connect("SOCKS5 authentication failed"));
            }
        }
        _ => return Err(Error::new_connect("SOCKS5 proxy offered no usable auth method")),
    }

    // connect request
    let mut req = vec![SOCKS5_VERSION, 0x01, 0x00];
    if let Ok(ip) = host.parse::<std::net::Ipv4Addr>() {
        req.push(0x01);
        req.extend_from_slice(&ip.octets());
    } else if let Ok(ip) = host.trim_matches(|c| c == '[' || c == ']').parse::<std::net::Ipv6Addr>()
    {
        req.push(0x04);
        req.extend_from_slice(&ip.octets());
    } else {
        if host.len() > 255 {
            return Err(Error::new_connect("SOCKS5 target host too long"));
        }
        req.push(0x03);
        req.push(host.len() as u8);
        req.extend_from_slice(host.as_bytes());
    }
    req.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&req).await.map_err(Error::new_connect)?;

    // reply
    let mut reply = [0u8; 4];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(Error::new_connect)?;
    if reply[1] != 0x00 {
        let reason = match reply[1] {
            0x01 => "general SOCKS server failure",
            0x02 => "connection not allowed by ruleset",
            0x03 => "network unreachable",
            0x04 => "host unreachable",
            0x05 => "connection refused",
            0x06 => "TTL expired",
            0x07 => "command not supported",
            0x08 => "address type not supported",
            _ => "unknown SOCKS5 failure",
        };
        return Err(Error::new_connect(reason));
    }
    let addr_len = match reply[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(Error::new_connect)?;
            len[0] as usize
        }
        _ => return Err(Error::new_connect("SOCKS5 proxy sent bad address type")),
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream
        .read_exact(&mut bound)
        .await
        .map_err(Error::new_connect)?;

    Ok(stream)
}
