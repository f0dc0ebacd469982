//! 端到端场景：绑定、请求体上限、连接限流、SNI、停机与空闲超时。
//!
//! 测试以裸 `TcpStream` 手写 HTTP/1.1 请求，断言线缆层面的可观察行为；
//! TLS 场景使用 rcgen 自签证书与关闭校验的 rustls 客户端。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use hearth_core::component::Component;
use hearth_core::error::BoxError;
use hearth_core::lifecycle;
use hearth_hosting::application::{Application, DispatchInfo};
use hearth_hosting::config::{EndpointConfig, HostConfig, ServiceConfig};
use hearth_hosting::root::{WebappAssembly, WebappRoot, WebappRootOptions};
use hearth_hosting::service::MemoryAccessLog;
use hearth_net::access::{AccessEvent, CloseReason};
use hearth_net::http::{IncomingRequest, OutgoingResponse, text_response};

/// 最小应用：`GET /` 返回 `200 ok`；POST 消费请求体后应答；其余未处理。
struct OkApp;

#[async_trait]
impl Application for OkApp {
    async fn handle_request(
        &self,
        mut request: IncomingRequest,
        _dispatch: DispatchInfo,
    ) -> Result<Option<OutgoingResponse>, BoxError> {
        if request.method == http::Method::GET && request.pathname().as_deref() == Some("/") {
            return Ok(Some(text_response(http::StatusCode::OK, "ok")));
        }
        if request.method == http::Method::POST {
            let body = request.collect_body().await?;
            return Ok(Some(text_response(
                http::StatusCode::OK,
                &format!("posted {} bytes", body.len()),
            )));
        }
        Ok(None)
    }
}

/// 永远抛错的应用：验证 500 翻译与连接存活。
struct FailingApp;

#[async_trait]
impl Application for FailingApp {
    async fn handle_request(
        &self,
        _request: IncomingRequest,
        _dispatch: DispatchInfo,
    ) -> Result<Option<OutgoingResponse>, BoxError> {
        Err("application exploded".into())
    }
}

fn endpoint_config(value: serde_json::Value) -> EndpointConfig {
    serde_json::from_value(value).expect("valid endpoint config")
}

fn service_config(value: serde_json::Value) -> ServiceConfig {
    serde_json::from_value(value).expect("valid service config")
}

async fn start_root(assembly: WebappAssembly) -> Arc<WebappRoot> {
    let root = WebappRoot::assemble(assembly, WebappRootOptions::default())
        .await
        .expect("assemble");
    let root_dyn: Arc<dyn Component> = Arc::clone(&root) as Arc<dyn Component>;
    lifecycle::init_root(&root_dyn).await.expect("init");
    lifecycle::start(&root_dyn).await.expect("start");
    root
}

async fn stop_root(root: &Arc<WebappRoot>) {
    let root_dyn: Arc<dyn Component> = Arc::clone(root) as Arc<dyn Component>;
    lifecycle::stop(&root_dyn, false).await.expect("stop");
}

/// 读取一个 HTTP/1.1 响应：状态码 + 按 Content-Length 收齐的响应体。
async fn read_response(stream: &mut TcpStream) -> (u16, String) {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        let read = stream.read(&mut chunk).await.expect("read response");
        assert!(read > 0, "connection closed before response head");
        buffer.extend_from_slice(&chunk[..read]);
        if let Some(position) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            break position + 4;
        }
    };

    let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
    let status: u16 = head
        .split_whitespace()
        .nth(1)
        .expect("status code")
        .parse()
        .expect("numeric status");
    let content_length: usize = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().ok())?
        })
        .unwrap_or(0);

    let mut body = buffer[header_end..].to_vec();
    while body.len() < content_length {
        let read = stream.read(&mut chunk).await.expect("read body");
        assert!(read > 0, "connection closed before body completed");
        body.extend_from_slice(&chunk[..read]);
    }
    (status, String::from_utf8_lossy(&body[..content_length]).to_string())
}

/// 场景 1：HTTP 绑定 `127.0.0.1:0`，`GET /` 观察到 `200 ok`。
#[tokio::test]
async fn plain_http_serves_ok() {
    let root = start_root(WebappAssembly {
        hosts: Vec::new(),
        services: Vec::new(),
        applications: vec![("site".to_string(), Arc::new(OkApp) as Arc<dyn Application>)],
        endpoints: vec![endpoint_config(serde_json::json!({
            "name": "main",
            "application": "site",
            "interface": { "address": "127.0.0.1", "port": 0 },
            "protocol": "http",
        }))],
    })
    .await;

    let addr = root.endpoint("main").unwrap().local_addr().unwrap();
    let mut client = TcpStream::connect(addr).await.expect("connect");
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
        .await
        .expect("write");
    let (status, body) = read_response(&mut client).await;
    assert_eq!(status, 200);
    assert_eq!(body, "ok");

    stop_root(&root).await;
}

/// 场景 2：请求体上限 8 字节，9 字节 POST 得到 413 且套接字保持可用。
#[tokio::test]
async fn oversized_body_yields_413_and_keeps_socket() {
    let root = start_root(WebappAssembly {
        hosts: Vec::new(),
        services: Vec::new(),
        applications: vec![("site".to_string(), Arc::new(OkApp) as Arc<dyn Application>)],
        endpoints: vec![endpoint_config(serde_json::json!({
            "name": "main",
            "application": "site",
            "interface": { "address": "127.0.0.1", "port": 0 },
            "protocol": "http",
            "maxRequestBodySize": 8,
        }))],
    })
    .await;

    let addr = root.endpoint("main").unwrap().local_addr().unwrap();
    let mut client = TcpStream::connect(addr).await.expect("connect");
    client
        .write_all(
            b"POST / HTTP/1.1\r\nHost: test\r\nContent-Length: 9\r\n\r\n123456789",
        )
        .await
        .expect("write");
    let (status, _) = read_response(&mut client).await;
    assert_eq!(status, 413);

    // 同一连接继续服务后续请求。
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: test\r\n\r\n")
        .await
        .expect("second write");
    let (status, body) = read_response(&mut client).await;
    assert_eq!(status, 200);
    assert_eq!(body, "ok");

    stop_root(&root).await;
}

/// 场景 3：连接限流容量 1、近零补充——第二条并发连接被立即拒绝。
#[tokio::test]
async fn second_connection_is_rate_limited() {
    let root = start_root(WebappAssembly {
        hosts: Vec::new(),
        services: vec![service_config(serde_json::json!({
            "class": "ConnectionRateLimiter",
            "name": "conn-limit",
            "maxBurst": 1.0,
            "flowRate": 0.0001,
        }))],
        applications: vec![("site".to_string(), Arc::new(OkApp) as Arc<dyn Application>)],
        endpoints: vec![endpoint_config(serde_json::json!({
            "name": "main",
            "application": "site",
            "interface": { "address": "127.0.0.1", "port": 0 },
            "protocol": "http",
            "services": { "connectionRateLimiter": "conn-limit" },
        }))],
    })
    .await;

    let addr = root.endpoint("main").unwrap().local_addr().unwrap();

    // 第一条连接吃掉唯一的令牌并保持存活。
    let mut first = TcpStream::connect(addr).await.expect("first connect");
    first
        .write_all(b"GET / HTTP/1.1\r\nHost: test\r\n\r\n")
        .await
        .expect("first write");
    let (status, _) = read_response(&mut first).await;
    assert_eq!(status, 200);

    // 第二条连接被准入拒绝：对端立即观察到关闭。
    let mut second = TcpStream::connect(addr).await.expect("second connect");
    let mut buf = [0u8; 1];
    let read = second.read(&mut buf).await.unwrap_or(0);
    assert_eq!(read, 0, "denied connection must close immediately");

    stop_root(&root).await;
}

mod sni {
    use super::*;
    use rustls::SignatureScheme;
    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls_pki_types::{CertificateDer, ServerName, UnixTime};

    /// 仅用于测试的证书校验旁路：记录并放行一切服务端证书。
    #[derive(Debug)]
    struct AcceptAnyCert;

    impl ServerCertVerifier for AcceptAnyCert {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }

    async fn handshake_and_peer_cert(
        addr: std::net::SocketAddr,
        server_name: &str,
        send_sni: bool,
    ) -> Vec<u8> {
        let mut config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth();
        config.enable_sni = send_sni;
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

        let tcp = TcpStream::connect(addr).await.expect("connect");
        let domain = ServerName::try_from(server_name.to_string()).expect("server name");
        let tls = connector.connect(domain, tcp).await.expect("handshake");
        let (_, session) = tls.get_ref();
        session
            .peer_certificates()
            .expect("server certificate")
            .first()
            .expect("leaf certificate")
            .as_ref()
            .to_vec()
    }

    /// 场景 4：SNI 命中精确绑定 → 证书 A；命中通配绑定或未发 SNI → 证书 B。
    #[tokio::test]
    async fn sni_selects_per_host_certificates() {
        let cert_a = rcgen::generate_simple_self_signed(vec!["a.example".to_string()])
            .expect("cert a");
        let cert_b = rcgen::generate_simple_self_signed(vec!["*.example".to_string()])
            .expect("cert b");

        let root = start_root(WebappAssembly {
            hosts: vec![
                serde_json::from_value::<HostConfig>(serde_json::json!({
                    "hostnames": "a.example",
                    "certificate": cert_a.cert.pem(),
                    "privateKey": cert_a.key_pair.serialize_pem(),
                }))
                .expect("host a"),
                serde_json::from_value::<HostConfig>(serde_json::json!({
                    "hostnames": ["*.example", "*"],
                    "certificate": cert_b.cert.pem(),
                    "privateKey": cert_b.key_pair.serialize_pem(),
                }))
                .expect("host b"),
            ],
            services: Vec::new(),
            applications: vec![("site".to_string(), Arc::new(OkApp) as Arc<dyn Application>)],
            endpoints: vec![endpoint_config(serde_json::json!({
                "name": "secure",
                "application": "site",
                "hostnames": ["a.example", "*.example", "*"],
                "interface": { "address": "127.0.0.1", "port": 0 },
                "protocol": "https",
            }))],
        })
        .await;

        let addr = root.endpoint("secure").unwrap().local_addr().unwrap();
        let der_a = cert_a.cert.der().as_ref().to_vec();
        let der_b = cert_b.cert.der().as_ref().to_vec();

        assert_eq!(handshake_and_peer_cert(addr, "a.example", true).await, der_a);
        assert_eq!(handshake_and_peer_cert(addr, "b.example", true).await, der_b);
        // 未携带 SNI：全通配绑定兜底。
        assert_eq!(handshake_and_peer_cert(addr, "a.example", false).await, der_b);

        stop_root(&root).await;
    }
}

/// 场景 5：根停机——端点在宽限内关闭，`when_stopped` 解析，后续连接不被服务。
#[tokio::test]
async fn root_stop_drains_endpoints() {
    let root = start_root(WebappAssembly {
        hosts: Vec::new(),
        services: Vec::new(),
        applications: vec![("site".to_string(), Arc::new(OkApp) as Arc<dyn Application>)],
        endpoints: vec![endpoint_config(serde_json::json!({
            "name": "main",
            "application": "site",
            "interface": { "address": "127.0.0.1", "port": 0 },
            "protocol": "http",
        }))],
    })
    .await;
    let addr = root.endpoint("main").unwrap().local_addr().unwrap();

    let root_dyn: Arc<dyn Component> = Arc::clone(&root) as Arc<dyn Component>;
    let waiter = tokio::spawn({
        let root_dyn = Arc::clone(&root_dyn);
        async move { lifecycle::when_stopped(&root_dyn).await }
    });

    lifecycle::stop(&root_dyn, false).await.expect("stop");
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("when_stopped must resolve")
        .expect("join");

    match TcpStream::connect(addr).await {
        Err(_) => {}
        Ok(mut stranded) => {
            let mut buf = [0u8; 1];
            assert_eq!(stranded.read(&mut buf).await.unwrap_or(0), 0);
        }
    }
}

/// 场景 6：读空闲超时——无流量连接被销毁，访问日志记录 `timeout` 收尾。
#[tokio::test]
async fn idle_socket_is_destroyed_and_logged() {
    let root = start_root(WebappAssembly {
        hosts: Vec::new(),
        services: vec![service_config(serde_json::json!({
            "class": "MemoryAccessLog",
            "name": "log",
        }))],
        applications: vec![("site".to_string(), Arc::new(OkApp) as Arc<dyn Application>)],
        endpoints: vec![endpoint_config(serde_json::json!({
            "name": "main",
            "application": "site",
            "interface": { "address": "127.0.0.1", "port": 0 },
            "protocol": "http",
            "services": { "accessLog": "log" },
            "socketTimeouts": { "idle": "200 ms", "closeGrace": "50 ms" },
        }))],
    })
    .await;

    let addr = root.endpoint("main").unwrap().local_addr().unwrap();
    let mut idle_client = TcpStream::connect(addr).await.expect("connect");

    // 空闲连接应在超时后被服务端关闭。
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(3), idle_client.read(&mut buf))
        .await
        .expect("server must close the idle socket")
        .unwrap_or(0);
    assert_eq!(read, 0);

    // 访问日志最终记录 timeout 收尾事件。
    let log_component = root.services().get("log", None).expect("log service");
    let log = hearth_core::component::downcast_arc::<MemoryAccessLog>(log_component)
        .expect("memory access log");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let closed = log.recent_events().iter().any(|event| {
            matches!(
                event,
                AccessEvent::ConnectionClosed { reason: CloseReason::Timeout, .. },
            )
        });
        if closed {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timeout close must reach the access log",
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    stop_root(&root).await;
}

/// 处理器失败翻译为 500，连接保持存活；未处理请求翻译为 404。
#[tokio::test]
async fn handler_errors_map_to_500_and_404() {
    let root = start_root(WebappAssembly {
        hosts: Vec::new(),
        services: Vec::new(),
        applications: vec![
            ("site".to_string(), Arc::new(OkApp) as Arc<dyn Application>),
            ("broken".to_string(), Arc::new(FailingApp) as Arc<dyn Application>),
        ],
        endpoints: vec![
            endpoint_config(serde_json::json!({
                "name": "main",
                "application": "site",
                "interface": { "address": "127.0.0.1", "port": 0 },
                "protocol": "http",
            })),
            endpoint_config(serde_json::json!({
                "name": "faulty",
                "application": "broken",
                "interface": { "address": "127.0.0.1", "port": 0 },
                "protocol": "http",
            })),
        ],
    })
    .await;

    // 未处理目标 → 404。
    let addr = root.endpoint("main").unwrap().local_addr().unwrap();
    let mut client = TcpStream::connect(addr).await.expect("connect");
    client
        .write_all(b"GET /missing HTTP/1.1\r\nHost: test\r\n\r\n")
        .await
        .expect("write");
    let (status, _) = read_response(&mut client).await;
    assert_eq!(status, 404);

    // 处理器报错 → 500，同一连接继续可用。
    let addr = root.endpoint("faulty").unwrap().local_addr().unwrap();
    let mut client = TcpStream::connect(addr).await.expect("connect");
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: test\r\n\r\n")
        .await
        .expect("write");
    let (status, _) = read_response(&mut client).await;
    assert_eq!(status, 500);
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: test\r\n\r\n")
        .await
        .expect("second write");
    let (status, _) = read_response(&mut client).await;
    assert_eq!(status, 500);

    stop_root(&root).await;
}
