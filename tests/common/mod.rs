//! Common utilities for integration tests
#![allow(dead_code)]

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// 任意双向流
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> Io for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Mock proxy behaviour after reading a CONNECT head
#[derive(Clone)]
pub enum ProxyBehavior {
    /// 200, then echo tunnel bytes
    Accept,
    /// Reply with the given status if the CONNECT target contains `host`, else accept
    RejectHost(String, u16),
    /// 200 followed by extra bytes in the same write
    IllegalBody,
    /// 200, then act as a TLS echo server inside the tunnel
    AcceptTls(Arc<rustls::ServerConfig>),
}

/// Mock forward proxy listening on loopback
pub struct MockProxy {
    pub addr: SocketAddr,
    connects: Arc<AtomicUsize>,
    heads: Arc<Mutex<Vec<String>>>,
}

impl MockProxy {
    pub async fn start(behavior: ProxyBehavior) -> Self {
        Self::start_with(behavior, None).await
    }

    /// `proxy_tls` makes the proxy listener itself speak TLS
    pub async fn start_with(
        behavior: ProxyBehavior,
        proxy_tls: Option<Arc<rustls::ServerConfig>>,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock proxy");
        let addr = listener.local_addr().expect("Failed to get local addr");
        let connects = Arc::new(AtomicUsize::new(0));
        let heads = Arc::new(Mutex::new(Vec::new()));

        let connects_task = connects.clone();
        let heads_task = heads.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                connects_task.fetch_add(1, Ordering::SeqCst);
                let behavior = behavior.clone();
                let heads = heads_task.clone();
                let proxy_tls = proxy_tls.clone();
                tokio::spawn(async move {
                    let stream: Box<dyn Io> = match proxy_tls {
                        Some(config) => match TlsAcceptor::from(config).accept(socket).await {
                            Ok(tls) => Box::new(tls),
                            Err(_) => return,
                        },
                        None => Box::new(socket),
                    };
                    handle_connect(stream, behavior, heads).await;
                });
            }
        });

        Self {
            addr,
            connects,
            heads,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Number of TCP connections accepted (one per CONNECT handshake)
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// CONNECT request heads seen so far
    pub fn heads(&self) -> Vec<String> {
        self.heads.lock().unwrap().clone()
    }
}

async fn read_head(stream: &mut Box<dyn Io>) -> Option<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.ok()?;
        head.push(byte[0]);
    }
    String::from_utf8(head).ok()
}

async fn handle_connect(
    mut stream: Box<dyn Io>,
    behavior: ProxyBehavior,
    heads: Arc<Mutex<Vec<String>>>,
) {
    let Some(head) = read_head(&mut stream).await else {
        return;
    };
    heads.lock().unwrap().push(head.clone());

    match behavior {
        ProxyBehavior::Accept => {
            if accept(&mut stream).await {
                echo(stream).await;
            }
        }
        ProxyBehavior::RejectHost(host, status) => {
            let request_line = head.lines().next().unwrap_or_default();
            if request_line.contains(&host) {
                let reply = format!(
                    "HTTP/1.1 {} Rejected\r\nContent-Length: 0\r\n\r\n",
                    status
                );
                let _ = stream.write_all(reply.as_bytes()).await;
                let _ = stream.shutdown().await;
            } else if accept(&mut stream).await {
                echo(stream).await;
            }
        }
        ProxyBehavior::IllegalBody => {
            let _ = stream
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\nunexpected")
                .await;
            let _ = stream.flush().await;
            let mut sink = Vec::new();
            let _ = stream.read_to_end(&mut sink).await;
        }
        ProxyBehavior::AcceptTls(config) => {
            if accept(&mut stream).await {
                if let Ok(tls) = TlsAcceptor::from(config).accept(stream).await {
                    echo(Box::new(tls)).await;
                }
            }
        }
    }
}

async fn accept(stream: &mut Box<dyn Io>) -> bool {
    stream
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await
        .is_ok()
        && stream.flush().await.is_ok()
}

async fn echo(mut stream: Box<dyn Io>) {
    let mut buf = vec![0u8; 8192];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if stream.write_all(&buf[..n]).await.is_err() || stream.flush().await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Self-signed server config for `localhost` / `127.0.0.1`
pub fn test_server_config() -> Arc<rustls::ServerConfig> {
    test_server_identity().0
}

/// Self-signed server config plus the certificate in PEM form, for use as a trust root
pub fn test_server_identity() -> (Arc<rustls::ServerConfig>, String) {
    let certified = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ])
    .expect("Failed to generate self-signed certificate");

    let pem = certified.cert.pem();
    let cert: CertificateDer<'static> = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        certified.signing_key.serialize_der(),
    ));

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .expect("Failed to create server config");
    (Arc::new(config), pem)
}

/// Round-trip a payload through a tunnel socket
pub async fn echo_roundtrip<S>(stream: &mut S, payload: &[u8]) -> Vec<u8>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(payload).await.expect("write failed");
    stream.flush().await.expect("flush failed");
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).await.expect("read failed");
    buf
}
