/// Integration tests for the tunneling agent against a loopback mock proxy
mod common;

use common::{
    echo_roundtrip, test_server_config, test_server_identity, MockProxy, ProxyBehavior,
};
use std::time::Duration;
use tokio::time::timeout;
use tunnel_agent::{
    AgentConfig, AgentConfigBuilder, OriginRequest, ProxyConfig, TlsMaterial, TunnelError,
    TunnelVariant, TunnelingAgent,
};

const WAIT: Duration = Duration::from_secs(5);

fn plain_agent(proxy: &MockProxy, max_sockets: usize) -> TunnelingAgent {
    let config = AgentConfigBuilder::new()
        .variant(TunnelVariant::HttpOverHttp)
        .proxy("127.0.0.1", proxy.port())
        .max_sockets(max_sockets)
        .build()
        .expect("valid config");
    TunnelingAgent::new(config).expect("agent starts")
}

fn insecure_tls() -> TlsMaterial {
    TlsMaterial {
        insecure_skip_verify: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_tunnel_carries_data() {
    let proxy = MockProxy::start(ProxyBehavior::Accept).await;
    let agent = plain_agent(&proxy, 4);

    let mut socket = timeout(WAIT, agent.connect(OriginRequest::new("example.test", 80)))
        .await
        .expect("timeout")
        .expect("tunnel established");

    assert_eq!(echo_roundtrip(&mut socket, b"GET / HTTP/1.1\r\n\r\n").await, b"GET / HTTP/1.1\r\n\r\n");
    assert_eq!(socket.target().host, "example.test");
    assert!(proxy.heads()[0].starts_with("CONNECT example.test:80 HTTP/1.1\r\n"));
    assert!(proxy.heads()[0].contains("Host: example.test:80\r\n"));
}

#[tokio::test]
async fn test_proxy_authorization_header() {
    let proxy = MockProxy::start(ProxyBehavior::Accept).await;
    let config = AgentConfigBuilder::new()
        .proxy("127.0.0.1", proxy.port())
        .proxy_auth("alice:secret")
        .proxy_header("X-Client", "tunnel-agent")
        .build()
        .unwrap();
    let agent = TunnelingAgent::new(config).unwrap();

    let _socket = timeout(WAIT, agent.connect(OriginRequest::new("example.test", 443)))
        .await
        .expect("timeout")
        .unwrap();

    let head = &proxy.heads()[0];
    assert!(head.contains("Proxy-Authorization: Basic YWxpY2U6c2VjcmV0\r\n"));
    assert!(head.contains("X-Client: tunnel-agent\r\n"));
}

#[tokio::test]
async fn test_same_origin_request_reuses_freed_socket() {
    let proxy = MockProxy::start(ProxyBehavior::Accept).await;
    let agent = plain_agent(&proxy, 1);

    let mut a = timeout(WAIT, agent.connect(OriginRequest::new("x.test", 80)))
        .await
        .unwrap()
        .unwrap();
    echo_roundtrip(&mut a, b"first").await;

    let pending = agent.add_request(OriginRequest::new("x.test", 80));
    let stats = agent.stats().await.unwrap();
    assert_eq!(stats.sockets, 1);
    assert_eq!(stats.pending, 1);

    let slot = a.slot();
    a.release();

    let mut b = timeout(WAIT, pending).await.unwrap().unwrap();
    assert!(b.is_reused());
    assert_eq!(b.slot(), slot);
    assert_eq!(echo_roundtrip(&mut b, b"second").await, b"second");
    assert_eq!(proxy.connect_count(), 1);

    let stats = agent.stats().await.unwrap();
    assert_eq!(stats.sockets, 1);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn test_other_origin_gets_fresh_handshake() {
    let proxy = MockProxy::start(ProxyBehavior::Accept).await;
    let agent = plain_agent(&proxy, 1);

    let a = timeout(WAIT, agent.connect(OriginRequest::new("x.test", 80)))
        .await
        .unwrap()
        .unwrap();
    let pending = agent.add_request(OriginRequest::new("y.test", 80));

    a.release();

    let mut b = timeout(WAIT, pending).await.unwrap().unwrap();
    assert!(!b.is_reused());
    assert_eq!(b.target().host, "y.test");
    assert_eq!(echo_roundtrip(&mut b, b"ping").await, b"ping");
    assert_eq!(proxy.connect_count(), 2);
    assert!(proxy.heads()[1].starts_with("CONNECT y.test:80 "));
}

#[tokio::test]
async fn test_rejected_connect_promotes_queued_request() {
    let proxy = MockProxy::start(ProxyBehavior::RejectHost("denied.test".to_string(), 407)).await;
    let agent = plain_agent(&proxy, 1);

    let denied = agent.add_request(OriginRequest::new("denied.test", 80));
    let queued = agent.add_request(OriginRequest::new("allowed.test", 80));

    let err = timeout(WAIT, denied).await.unwrap().unwrap_err();
    assert!(err.is_handshake_status());
    assert_eq!(err.status_code(), Some(407));

    let mut socket = timeout(WAIT, queued).await.unwrap().unwrap();
    assert_eq!(echo_roundtrip(&mut socket, b"ok").await, b"ok");
    assert_eq!(proxy.connect_count(), 2);

    let stats = agent.stats().await.unwrap();
    assert_eq!(stats.sockets, 1);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn test_illegal_body_is_rejected() {
    let proxy = MockProxy::start(ProxyBehavior::IllegalBody).await;
    let agent = plain_agent(&proxy, 1);

    let err = timeout(WAIT, agent.connect(OriginRequest::new("x.test", 80)))
        .await
        .unwrap()
        .unwrap_err();
    assert!(err.is_illegal_body());
    assert!(matches!(err, TunnelError::IllegalBody { len } if len > 0));
    assert_eq!(agent.stats().await.unwrap().sockets, 0);
}

#[tokio::test]
async fn test_unreachable_proxy_is_transport_error() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = AgentConfig::http_over_http(ProxyConfig::new("127.0.0.1", port));
    let agent = TunnelingAgent::new(config).unwrap();

    let err = timeout(WAIT, agent.connect(OriginRequest::new("x.test", 80)))
        .await
        .unwrap()
        .unwrap_err();
    assert!(err.is_transport());
    assert_eq!(agent.stats().await.unwrap().sockets, 0);
}

#[tokio::test]
async fn test_pool_never_exceeds_max_sockets() {
    let proxy = MockProxy::start(ProxyBehavior::Accept).await;
    let agent = plain_agent(&proxy, 2);

    let pending: Vec<_> = (0..6)
        .map(|i| agent.add_request(OriginRequest::new(format!("host{}.test", i), 80)))
        .collect();

    let stats = agent.stats().await.unwrap();
    assert!(stats.sockets <= 2);
    assert_eq!(stats.pending, 4);

    for (i, tunnel) in pending.into_iter().enumerate() {
        let socket = timeout(WAIT, tunnel).await.unwrap().unwrap();
        assert_eq!(socket.target().host, format!("host{}.test", i));
        assert!(agent.stats().await.unwrap().sockets <= 2);
        socket.release();
    }

    assert_eq!(proxy.connect_count(), 6);
}

#[tokio::test]
async fn test_closing_socket_frees_capacity() {
    let proxy = MockProxy::start(ProxyBehavior::Accept).await;
    let agent = plain_agent(&proxy, 1);

    let a = timeout(WAIT, agent.connect(OriginRequest::new("x.test", 80)))
        .await
        .unwrap()
        .unwrap();
    let pending = agent.add_request(OriginRequest::new("x.test", 80));

    // 直接丢弃视为关闭，不复用
    drop(a);

    let b = timeout(WAIT, pending).await.unwrap().unwrap();
    assert!(!b.is_reused());
    assert_eq!(proxy.connect_count(), 2);
}

#[tokio::test]
async fn test_detach_removes_socket_from_pool() {
    let proxy = MockProxy::start(ProxyBehavior::Accept).await;
    let agent = plain_agent(&proxy, 1);

    let a = timeout(WAIT, agent.connect(OriginRequest::new("x.test", 80)))
        .await
        .unwrap()
        .unwrap();
    let mut stream = a.detach();
    assert_eq!(echo_roundtrip(&mut stream, b"raw").await, b"raw");

    let stats = agent.stats().await.unwrap();
    assert_eq!(stats.sockets, 0);

    // 容量已释放，新的请求可立即握手
    let _b = timeout(WAIT, agent.connect(OriginRequest::new("x.test", 80)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(proxy.connect_count(), 2);
}

#[tokio::test]
async fn test_dropped_waiters_leave_queue() {
    let proxy = MockProxy::start(ProxyBehavior::Accept).await;
    let agent = plain_agent(&proxy, 1);

    let _a = timeout(WAIT, agent.connect(OriginRequest::new("x.test", 80)))
        .await
        .unwrap()
        .unwrap();
    for i in 0..100 {
        drop(agent.add_request(OriginRequest::new(format!("host{}.test", i), 80)));
    }

    let stats = agent.stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.sockets, 1);
}

#[tokio::test]
async fn test_cancel_and_shutdown() {
    let proxy = MockProxy::start(ProxyBehavior::Accept).await;
    let agent = plain_agent(&proxy, 1);

    let _a = timeout(WAIT, agent.connect(OriginRequest::new("x.test", 80)))
        .await
        .unwrap()
        .unwrap();
    let cancelled = agent.add_request(OriginRequest::new("x.test", 80));
    let closed = agent.add_request(OriginRequest::new("x.test", 80));

    assert!(agent.cancel(cancelled.id()).await);
    assert!(matches!(cancelled.await, Err(TunnelError::Cancelled)));

    agent.shutdown();
    assert!(matches!(
        timeout(WAIT, closed).await.unwrap(),
        Err(TunnelError::AgentClosed)
    ));
}

#[tokio::test]
async fn test_https_over_http_wraps_tunnel_in_tls() {
    let proxy = MockProxy::start(ProxyBehavior::AcceptTls(test_server_config())).await;
    let config = AgentConfigBuilder::new()
        .variant(TunnelVariant::HttpsOverHttp)
        .proxy("127.0.0.1", proxy.port())
        .max_sockets(1)
        .tls(insecure_tls())
        .build()
        .unwrap();
    let agent = TunnelingAgent::new(config).unwrap();

    let request = OriginRequest::new("127.0.0.1", 443).with_host_header("localhost:443");
    let mut socket = timeout(WAIT, agent.connect(request)).await.unwrap().unwrap();
    assert!(socket.is_secure());
    assert_eq!(echo_roundtrip(&mut socket, b"secret").await, b"secret");

    let stats = agent.stats().await.unwrap();
    assert_eq!(stats.sockets, 1);
    assert_eq!(stats.secure, 1);

    // 复用的 TLS 会话仍然可用
    let pending = agent.add_request(OriginRequest::new("127.0.0.1", 443));
    socket.release();
    let mut reused = timeout(WAIT, pending).await.unwrap().unwrap();
    assert!(reused.is_reused());
    assert!(reused.is_secure());
    assert_eq!(echo_roundtrip(&mut reused, b"again").await, b"again");
    assert_eq!(proxy.connect_count(), 1);
}

#[tokio::test]
async fn test_configured_server_name_used_without_host_header() {
    let (server_config, pem) = test_server_identity();
    let ca_path = std::env::temp_dir().join(format!("tunnel-agent-ca-{}.pem", std::process::id()));
    std::fs::write(&ca_path, pem).unwrap();

    let proxy = MockProxy::start(ProxyBehavior::AcceptTls(server_config)).await;
    let config = AgentConfigBuilder::new()
        .variant(TunnelVariant::HttpsOverHttp)
        .proxy("127.0.0.1", proxy.port())
        .tls(TlsMaterial {
            ca_paths: vec![ca_path.clone()],
            server_name: Some("localhost".to_string()),
            ..Default::default()
        })
        .build()
        .unwrap();
    let agent = TunnelingAgent::new(config).unwrap();
    let _ = std::fs::remove_file(&ca_path);

    // 证书只覆盖 localhost，目标主机名无法通过校验
    let mut socket = timeout(WAIT, agent.connect(OriginRequest::new("origin.internal", 443)))
        .await
        .unwrap()
        .unwrap();
    assert!(socket.is_secure());
    assert_eq!(echo_roundtrip(&mut socket, b"verified").await, b"verified");
}

#[tokio::test]
async fn test_https_over_https_double_tls() {
    let server_config = test_server_config();
    let proxy = MockProxy::start_with(
        ProxyBehavior::AcceptTls(server_config.clone()),
        Some(server_config),
    )
    .await;

    let config = AgentConfigBuilder::new()
        .variant(TunnelVariant::HttpsOverHttps)
        .proxy("127.0.0.1", proxy.port())
        .proxy_tls(TlsMaterial {
            server_name: Some("localhost".to_string()),
            ..insecure_tls()
        })
        .tls(insecure_tls())
        .build()
        .unwrap();
    let agent = TunnelingAgent::new(config).unwrap();

    let mut socket = timeout(WAIT, agent.connect(OriginRequest::new("localhost", 443)))
        .await
        .unwrap()
        .unwrap();
    assert!(socket.is_secure());
    assert_eq!(echo_roundtrip(&mut socket, b"inner").await, b"inner");
    assert!(proxy.heads()[0].starts_with("CONNECT localhost:443 "));
}

#[tokio::test]
async fn test_http_over_https_plain_destination() {
    let proxy = MockProxy::start_with(ProxyBehavior::Accept, Some(test_server_config())).await;
    let config = AgentConfigBuilder::new()
        .variant(TunnelVariant::HttpOverHttps)
        .proxy("127.0.0.1", proxy.port())
        .proxy_tls(insecure_tls())
        .build()
        .unwrap();
    let agent = TunnelingAgent::new(config).unwrap();

    let mut socket = timeout(WAIT, agent.connect(OriginRequest::new("x.test", 80)))
        .await
        .unwrap()
        .unwrap();
    assert!(!socket.is_secure());
    assert_eq!(echo_roundtrip(&mut socket, b"plain").await, b"plain");
}
