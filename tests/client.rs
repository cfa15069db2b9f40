#![deny(rust_2018_idioms)]

use std::io::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use trestle::client::proxy_url;
use trestle::server::{handler_fn, ResponseWriter, Server};
use trestle::{Body, CancellationToken, Request, StatusCode, Transport};

mod support;
use support::*;

fn hi<'a>(w: &'a mut ResponseWriter, _req: &'a mut Request) -> BoxFuture<'a, ()> {
    Box::pin(async move {
        let _ = w.write(b"hi").await;
    })
}

fn transport() -> Transport {
    Transport::builder().no_proxy().build()
}

fn url(addr: SocketAddr, path: &str) -> String {
    format!("http://{}{}", addr, path)
}

#[tokio::test]
async fn get_twice_reuses_the_connection() {
    let log = AddrLog::default();
    let seen = log.clone();

    struct Recorder {
        log: AddrLog,
    }
    impl trestle::Handler for Recorder {
        fn serve<'a>(
            &'a self,
            w: &'a mut ResponseWriter,
            req: &'a mut Request,
        ) -> BoxFuture<'a, ()> {
            self.log.record(req.remote_addr);
            Box::pin(async move {
                let _ = w.write(b"hi").await;
            })
        }
    }
    let (_server, addr) = spawn_server(Server::new(Recorder { log })).await;
    let transport = transport();

    for _ in 0..2 {
        let req = Request::get(&url(addr, "/")).unwrap();
        let mut resp = transport.round_trip(req).await.expect("round trip");
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.content_length, 2);
        let body = resp.body.read_to_end().await.unwrap();
        assert_eq!(&body[..], b"hi");
        // body EOF returns the conn to the pool
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let seen = seen.snapshot();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], seen[1], "same server-side connection");
    assert_eq!(transport.idle_connections(), 1);
}

#[tokio::test]
async fn head_with_declared_chunked() {
    fn head_chunky<'a>(w: &'a mut ResponseWriter, _req: &'a mut Request) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            w.headers_mut()
                .insert("transfer-encoding", "chunked".parse().unwrap());
            let _ = w.write(&[b'x'; 123]).await;
        })
    }
    let (_server, addr) = spawn_server(Server::new(handler_fn(head_chunky))).await;
    let transport = transport();

    let req = Request::head(&url(addr, "/")).unwrap();
    let mut resp = transport.round_trip(req).await.expect("round trip");
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.content_length, -1);
    assert_eq!(resp.transfer_encoding, vec!["chunked".to_owned()]);
    let body = resp.body.read_to_end().await.unwrap();
    assert!(body.is_empty(), "HEAD body must be immediate EOF");

    // the connection survives for the next request
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(transport.idle_connections(), 1);
    let resp = transport
        .round_trip(Request::get(&url(addr, "/")).unwrap())
        .await
        .expect("second round trip");
    assert_eq!(resp.status, StatusCode::OK);
}

#[tokio::test]
async fn expect_continue_happy_path() {
    fn reader<'a>(w: &'a mut ResponseWriter, req: &'a mut Request) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let body = req.body.read_to_end().await.expect("server body read");
            assert_eq!(&body[..], b"hello");
            let _ = w.write(b"ok").await;
        })
    }
    let (_server, addr) = spawn_server(Server::new(handler_fn(reader))).await;
    let transport = transport();

    let mut req = Request::put(&url(addr, "/100"), Body::from("hello")).unwrap();
    req.headers
        .insert(trestle::header::EXPECT, "100-continue".parse().unwrap());
    let mut resp = transport.round_trip(req).await.expect("round trip");
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(&resp.body.read_to_end().await.unwrap()[..], b"ok");
}

#[tokio::test]
async fn expect_continue_refused_sends_no_body() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let leftover: Arc<Mutex<Vec<u8>>> = Arc::default();
    let leftover_in = leftover.clone();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            assert_eq!(stream.read(&mut byte).await.unwrap(), 1);
            head.push(byte[0]);
        }
        assert!(s(&head).contains("Expect: 100-continue"));
        // refuse: reply without a 100
        stream
            .write_all(b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        // the client must close without ever sending body bytes
        let mut rest = Vec::new();
        let _ = tokio::time::timeout(
            Duration::from_millis(700),
            stream.read_to_end(&mut rest),
        )
        .await;
        *leftover_in.lock().unwrap() = rest;
    });

    let transport = transport();
    let mut req = Request::put(&url(addr, "/100"), Body::from("hello")).unwrap();
    req.headers
        .insert(trestle::header::EXPECT, "100-continue".parse().unwrap());
    let resp = transport.round_trip(req).await.expect("round trip");
    assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
    assert!(resp.close);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        leftover.lock().unwrap().is_empty(),
        "client sent body bytes despite refusal"
    );
}

#[tokio::test]
async fn retries_idempotent_request_on_stale_keep_alive() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));
    let accepts_in = accepts.clone();

    tokio::spawn(async move {
        // first connection: one good response, then hang up on the next
        // request without answering
        let (mut stream, _) = listener.accept().await.unwrap();
        accepts_in.fetch_add(1, Ordering::SeqCst);
        read_one_head(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
        read_one_head(&mut stream).await;
        drop(stream);

        // second connection: serve the retried request
        let (mut stream, _) = listener.accept().await.unwrap();
        accepts_in.fetch_add(1, Ordering::SeqCst);
        read_one_head(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nretry")
            .await
            .unwrap();
    });

    let transport = transport();
    let mut resp = transport
        .round_trip(Request::get(&url(addr, "/")).unwrap())
        .await
        .expect("first request");
    assert_eq!(&resp.body.read_to_end().await.unwrap()[..], b"ok");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.idle_connections(), 1, "conn pooled after first");

    let mut resp = transport
        .round_trip(Request::get(&url(addr, "/")).unwrap())
        .await
        .expect("second request should retry onto a fresh dial");
    assert_eq!(&resp.body.read_to_end().await.unwrap()[..], b"retry");
    assert_eq!(accepts.load(Ordering::SeqCst), 2, "exactly one redial");
}

async fn read_one_head(stream: &mut tokio::net::TcpStream) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(1) => head.push(byte[0]),
            _ => return,
        }
    }
}

#[tokio::test]
async fn gzip_is_transparently_decoded() {
    let compressed = {
        let mut enc =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(b"hello gzip world").unwrap();
        enc.finish().unwrap()
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let request_text: Arc<Mutex<String>> = Arc::default();
    let request_text_in = request_text.clone();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            assert_eq!(stream.read(&mut byte).await.unwrap(), 1);
            head.push(byte[0]);
        }
        *request_text_in.lock().unwrap() = s(&head);
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            compressed.len()
        );
        stream.write_all(head.as_bytes()).await.unwrap();
        stream.write_all(&compressed).await.unwrap();
    });

    let transport = transport();
    let mut resp = transport
        .round_trip(Request::get(&url(addr, "/")).unwrap())
        .await
        .expect("round trip");
    assert!(resp.uncompressed);
    assert_eq!(resp.content_length, -1);
    assert!(resp.headers.get("content-encoding").is_none());
    let body = resp.body.read_to_end().await.unwrap();
    assert_eq!(&body[..], b"hello gzip world");

    let request_text = request_text.lock().unwrap().clone();
    assert!(
        request_text.contains("Accept-Encoding: gzip\r\n"),
        "request: {:?}",
        request_text
    );
}

#[tokio::test]
async fn pool_idle_timeout_expires_connections() {
    let (_server, addr) = spawn_server(Server::new(handler_fn(hi))).await;
    let transport = Transport::builder()
        .no_proxy()
        .idle_conn_timeout(Duration::from_millis(300))
        .build();

    let mut resp = transport
        .round_trip(Request::get(&url(addr, "/")).unwrap())
        .await
        .expect("round trip");
    let _ = resp.body.read_to_end().await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.idle_connections(), 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(transport.idle_connections(), 0, "idle conn timed out");
}

#[tokio::test]
async fn close_idle_connections_empties_pool() {
    let (_server, addr) = spawn_server(Server::new(handler_fn(hi))).await;
    let transport = transport();
    let mut resp = transport
        .round_trip(Request::get(&url(addr, "/")).unwrap())
        .await
        .unwrap();
    let _ = resp.body.read_to_end().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.idle_connections(), 1);

    transport.close_idle_connections();
    assert_eq!(transport.idle_connections(), 0);
}

#[tokio::test]
async fn chunked_response_trailers_are_delivered() {
    fn with_trailers<'a>(w: &'a mut ResponseWriter, _req: &'a mut Request) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            w.trailers_mut()
                .insert("chunky-trailer", "trailer value".parse().unwrap());
            let _ = w.write(b"streaming").await;
            let _ = w.flush().await;
        })
    }
    let (_server, addr) = spawn_server(Server::new(handler_fn(with_trailers))).await;
    let transport = transport();

    let mut resp = transport
        .round_trip(Request::get(&url(addr, "/")).unwrap())
        .await
        .expect("round trip");
    assert_eq!(resp.content_length, -1);
    let body = resp.body.read_to_end().await.unwrap();
    assert_eq!(&body[..], b"streaming");
    let trailers = resp.trailer();
    assert_eq!(trailers["chunky-trailer"], "trailer value");
}

#[tokio::test]
async fn cancel_aborts_an_inflight_request() {
    fn sleepy<'a>(w: &'a mut ResponseWriter, _req: &'a mut Request) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            let _ = w.write(b"too late").await;
        })
    }
    let (_server, addr) = spawn_server(Server::new(handler_fn(sleepy))).await;
    let transport = transport();

    let cancel = CancellationToken::new();
    let mut req = Request::get(&url(addr, "/")).unwrap();
    req.cancel = Some(cancel.clone());

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let err = transport.round_trip(req).await.expect_err("canceled");
    assert!(err.is_canceled(), "got: {:?}", err);
}

#[tokio::test]
async fn proxied_http_uses_absolute_form_and_auth() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();
    let request_text: Arc<Mutex<String>> = Arc::default();
    let request_text_in = request_text.clone();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            assert_eq!(stream.read(&mut byte).await.unwrap(), 1);
            head.push(byte[0]);
        }
        *request_text_in.lock().unwrap() = s(&head);
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
            .await
            .unwrap();
    });

    let proxy_uri: trestle::Uri = format!("http://user:pw@{}", proxy_addr).parse().unwrap();
    let transport = Transport::builder().proxy(proxy_url(proxy_uri)).build();
    let mut resp = transport
        .round_trip(Request::get("http://example.com/thing").unwrap())
        .await
        .expect("round trip via proxy");
    assert_eq!(&resp.body.read_to_end().await.unwrap()[..], b"ok");

    let request_text = request_text.lock().unwrap().clone();
    assert!(
        request_text.starts_with("GET http://example.com/thing HTTP/1.1\r\n"),
        "request: {:?}",
        request_text
    );
    assert!(
        request_text.contains("Proxy-Authorization: Basic dXNlcjpwdw==\r\n"),
        "request: {:?}",
        request_text
    );
    assert!(
        request_text.contains("Host: example.com\r\n"),
        "request: {:?}",
        request_text
    );
}
