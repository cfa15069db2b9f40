#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use trestle::server::Server;

/// Binds a throwaway port and serves `server` on it.
pub async fn spawn_server(server: Server) -> (Arc<Server>, SocketAddr) {
    let _ = pretty_env_logger::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    let server = Arc::new(server);
    let srv = server.clone();
    tokio::spawn(async move {
        let _ = srv.serve(listener).await;
    });
    (server, addr)
}

pub async fn connect(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.expect("connect")
}

/// Reads until the peer closes the connection.
pub async fn read_to_end(stream: &mut TcpStream) -> Vec<u8> {
    let mut all = Vec::new();
    stream.read_to_end(&mut all).await.expect("read_to_end");
    all
}

/// Reads one response's head: everything through the first blank line.
pub async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.expect("read head byte");
        assert!(n == 1, "EOF while reading response head: {:?}", s(&head));
        head.push(byte[0]);
    }
    s(&head)
}

pub async fn read_exactly(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).await.expect("read_exact");
    buf
}

pub async fn write_all(stream: &mut TcpStream, bytes: &[u8]) {
    stream.write_all(bytes).await.expect("write_all");
}

pub fn s(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Remote addresses observed per request, for same-connection checks.
#[derive(Clone, Default)]
pub struct AddrLog(pub Arc<Mutex<Vec<SocketAddr>>>);

impl AddrLog {
    pub fn record(&self, addr: Option<SocketAddr>) {
        if let Some(addr) = addr {
            self.0.lock().unwrap().push(addr);
        }
    }

    pub fn snapshot(&self) -> Vec<SocketAddr> {
        self.0.lock().unwrap().clone()
    }
}
