use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use n0_error::{Result, StackResultExt, StdResultExt, anyerr};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::timeout,
};

use crate::{
    Proxy, ProxyConfig,
    config::HEADER_SECTION_MAX_LENGTH,
    parse::ResponseHead,
    util::ReadAhead,
};

/// Loopback clients only, both families.
const LOCAL_ALLOW: &str = "127.0.0.1,::1";

// -- Test helpers --

fn local_config() -> ProxyConfig {
    ProxyConfig {
        allow: LOCAL_ALLOW.to_string(),
        ..ProxyConfig::default()
    }
}

/// Spawns the proxy on an ephemeral port.
async fn spawn_proxy(config: ProxyConfig) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
    let proxy = Arc::new(Proxy::new(config).map_err(|err| anyerr!(err))?);
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(proxy.serve(listener));
    Ok((addr, task))
}

/// Spawns an HTTP origin answering "{label} {METHOD} {PATH}", counting
/// accepted connections.
async fn spawn_origin(
    label: &'static str,
) -> Result<(SocketAddr, Arc<AtomicUsize>, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let conns = Arc::new(AtomicUsize::new(0));
    let task = tokio::spawn(origin_server::run(listener, label, conns.clone()));
    Ok((addr, conns, task))
}

/// Spawns an HTTP origin answering "{label} {METHOD} {PATH}: {BODY}".
async fn spawn_origin_echo_body(label: &'static str) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(origin_server::run_echo_body(listener, label));
    Ok((addr, task))
}

/// Spawns a raw TCP echo server.
async fn spawn_echo_server() -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    Ok((addr, task))
}

/// Spawns an origin that answers every request with a fixed chunked body
/// and closes.
async fn spawn_chunked_origin() -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                // read up to the end of the request head, then answer
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    let Ok(n) = stream.read(&mut chunk).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let _ = stream
                    .write_all(
                        b"HTTP/1.1 200 OK\r\n\
                          Transfer-Encoding: chunked\r\n\
                          Connection: close\r\n\r\n\
                          4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n",
                    )
                    .await;
            });
        }
    });
    Ok((addr, task))
}

/// Reads one Content-Length framed response off the stream.
async fn read_one_response<R: AsyncRead + Unpin>(
    rd: &mut ReadAhead<R>,
) -> Result<(ResponseHead, Vec<u8>)> {
    let head = ResponseHead::read(rd).await?;
    let len: usize = head
        .headers
        .get(CONTENT_LENGTH)
        .context("response has no content-length")?
        .to_str()
        .anyerr()?
        .parse()
        .anyerr()?;
    let mut body = vec![0u8; len];
    rd.read_exact(&mut body).await?;
    Ok((head, body))
}

fn proxied_client(proxy_addr: SocketAddr) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{proxy_addr}")).anyerr()?)
        .build()
        .anyerr()
}

// -- Tests --

/// Two keep-alive GETs on one client connection both succeed, and the
/// origin sees a single (pooled) upstream connection.
#[tokio::test]
async fn keep_alive_gets_reuse_client_and_upstream_connections() -> Result<()> {
    let (origin_addr, conns, _origin_task) = spawn_origin("origin").await?;
    let (proxy_addr, _proxy_task) = spawn_proxy(local_config()).await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    let (rd, mut wr) = stream.split();
    let mut rd = ReadAhead::new(rd, HEADER_SECTION_MAX_LENGTH);

    for i in 0..2 {
        let req =
            format!("GET http://{origin_addr}/r/{i} HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n");
        wr.write_all(req.as_bytes()).await?;
        let (head, body) = read_one_response(&mut rd).await?;
        assert_eq!(head.status.as_u16(), 200);
        assert_eq!(body, format!("origin GET /r/{i}").into_bytes());
    }

    assert_eq!(conns.load(Ordering::SeqCst), 1);
    Ok(())
}

/// A client outside the allow list is closed with zero bytes written.
#[tokio::test]
async fn rejected_client_sees_zero_bytes() -> Result<()> {
    let config = ProxyConfig {
        allow: "203.0.113.0/24".to_string(),
        ..ProxyConfig::default()
    };
    let (proxy_addr, _proxy_task) = spawn_proxy(config).await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    let mut received = Vec::new();
    timeout(Duration::from_secs(3), stream.read_to_end(&mut received))
        .await
        .anyerr()??;
    assert!(received.is_empty());
    Ok(())
}

/// The CONNECT confirmation is byte-exact, tunneled bytes arrive
/// unmodified, and the tunnel winds down once both directions hit EOF.
#[tokio::test]
async fn connect_tunnel_is_byte_exact_and_relays() -> Result<()> {
    let (echo_addr, _echo_task) = spawn_echo_server().await?;
    let (proxy_addr, _proxy_task) = spawn_proxy(local_config()).await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    let connect = format!("CONNECT {echo_addr} HTTP/1.1\r\nHost: {echo_addr}\r\n\r\n");
    stream.write_all(connect.as_bytes()).await?;

    let expected = b"HTTP/1.1 200 Connection Established\r\n\r\n";
    let mut got = vec![0u8; expected.len()];
    stream.read_exact(&mut got).await?;
    assert_eq!(got, expected);

    stream.write_all(b"hello tunnel").await?;
    let mut echoed = [0u8; 12];
    stream.read_exact(&mut echoed).await?;
    assert_eq!(&echoed, b"hello tunnel");

    // our EOF propagates as a half-close; the echo server then closes and
    // the tunnel finishes
    stream.shutdown().await?;
    let mut rest = Vec::new();
    timeout(Duration::from_secs(3), stream.read_to_end(&mut rest))
        .await
        .anyerr()??;
    assert!(rest.is_empty());
    Ok(())
}

/// Bytes pipelined right behind the CONNECT head reach the origin.
#[tokio::test]
async fn connect_flushes_bytes_buffered_with_the_head() -> Result<()> {
    let (echo_addr, _echo_task) = spawn_echo_server().await?;
    let (proxy_addr, _proxy_task) = spawn_proxy(local_config()).await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    let connect = format!("CONNECT {echo_addr} HTTP/1.1\r\nHost: {echo_addr}\r\n\r\nearly");
    stream.write_all(connect.as_bytes()).await?;

    let expected = b"HTTP/1.1 200 Connection Established\r\n\r\n";
    let mut got = vec![0u8; expected.len()];
    stream.read_exact(&mut got).await?;
    assert_eq!(got, expected);

    let mut echoed = [0u8; 5];
    stream.read_exact(&mut echoed).await?;
    assert_eq!(&echoed, b"early");
    Ok(())
}

/// CONNECT to a dead origin answers 502 and closes.
#[tokio::test]
async fn connect_to_unreachable_origin_yields_502() -> Result<()> {
    let (proxy_addr, _proxy_task) = spawn_proxy(local_config()).await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream
        .write_all(b"CONNECT 127.0.0.1:1 HTTP/1.1\r\nHost: 127.0.0.1:1\r\n\r\n")
        .await?;

    let (rd, _wr) = stream.split();
    let mut rd = ReadAhead::new(rd, HEADER_SECTION_MAX_LENGTH);
    let (head, body) = read_one_response(&mut rd).await?;
    assert_eq!(head.status.as_u16(), 502);
    assert_eq!(head.headers.get(CONNECTION).unwrap(), "close");
    assert!(body.is_empty());
    Ok(())
}

/// A request naming no target at all answers 400.
#[tokio::test]
async fn request_without_target_yields_400() -> Result<()> {
    let (proxy_addr, _proxy_task) = spawn_proxy(local_config()).await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream.write_all(b"GET /x HTTP/1.1\r\n\r\n").await?;

    let (rd, _wr) = stream.split();
    let mut rd = ReadAhead::new(rd, HEADER_SECTION_MAX_LENGTH);
    let (head, body) = read_one_response(&mut rd).await?;
    assert_eq!(head.status.as_u16(), 400);
    assert!(body.is_empty());
    Ok(())
}

/// Absolute-form GET and POST-with-body work through a proxy-aware client.
#[tokio::test]
async fn forwards_gets_and_posts_for_a_proxied_client() -> Result<()> {
    let (origin_addr, _conns, _origin_task) = spawn_origin("origin").await?;
    let (echo_addr, _echo_task) = spawn_origin_echo_body("echo").await?;
    let (proxy_addr, _proxy_task) = spawn_proxy(local_config()).await?;

    let client = proxied_client(proxy_addr)?;

    let res = client
        .get(format!("http://{origin_addr}/test/path"))
        .send()
        .await
        .anyerr()?;
    assert_eq!(res.status().as_u16(), 200);
    assert_eq!(res.text().await.anyerr()?, "origin GET /test/path");

    let res = client
        .post(format!("http://{echo_addr}/upload"))
        .body("hello request body")
        .send()
        .await
        .anyerr()?;
    assert_eq!(res.status().as_u16(), 200);
    assert_eq!(
        res.text().await.anyerr()?,
        "echo POST /upload: hello request body"
    );
    Ok(())
}

/// Chunked response framing passes through byte-for-byte.
#[tokio::test]
async fn chunked_responses_pass_through_unmodified() -> Result<()> {
    let (origin_addr, _origin_task) = spawn_chunked_origin().await?;
    let (proxy_addr, _proxy_task) = spawn_proxy(local_config()).await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    let req = format!(
        "GET http://{origin_addr}/c HTTP/1.1\r\nHost: {origin_addr}\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(req.as_bytes()).await?;

    let (rd, _wr) = stream.split();
    let mut rd = ReadAhead::new(rd, HEADER_SECTION_MAX_LENGTH);
    let head = ResponseHead::read(&mut rd).await?;
    assert_eq!(head.status.as_u16(), 200);
    assert_eq!(head.headers.get(TRANSFER_ENCODING).unwrap(), "chunked");
    assert_eq!(head.headers.get(CONNECTION).unwrap(), "close");

    let mut body = Vec::new();
    timeout(Duration::from_secs(3), rd.read_to_end(&mut body))
        .await
        .anyerr()??;
    assert_eq!(body, b"4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n");
    Ok(())
}

/// An HTTP/1.0 request without keep-alive closes after the response.
#[tokio::test]
async fn http10_request_defaults_to_close() -> Result<()> {
    let (origin_addr, _conns, _origin_task) = spawn_origin("origin").await?;
    let (proxy_addr, _proxy_task) = spawn_proxy(local_config()).await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    let req = format!("GET http://{origin_addr}/old HTTP/1.0\r\nHost: {origin_addr}\r\n\r\n");
    stream.write_all(req.as_bytes()).await?;

    let (rd, _wr) = stream.split();
    let mut rd = ReadAhead::new(rd, HEADER_SECTION_MAX_LENGTH);
    let (head, body) = read_one_response(&mut rd).await?;
    assert_eq!(head.status.as_u16(), 200);
    assert_eq!(head.headers.get(CONNECTION).unwrap(), "close");
    assert_eq!(body, b"origin GET /old");

    let mut rest = Vec::new();
    timeout(Duration::from_secs(3), rd.read_to_end(&mut rest))
        .await
        .anyerr()??;
    assert!(rest.is_empty());
    Ok(())
}

/// A silent tunnel is torn down once the idle timeout elapses.
#[tokio::test]
async fn idle_timeout_closes_a_silent_tunnel() -> Result<()> {
    let config = ProxyConfig {
        allow: LOCAL_ALLOW.to_string(),
        idle_timeout: Duration::from_millis(200),
        ..ProxyConfig::default()
    };
    let (echo_addr, _echo_task) = spawn_echo_server().await?;
    let (proxy_addr, _proxy_task) = spawn_proxy(config).await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    let connect = format!("CONNECT {echo_addr} HTTP/1.1\r\nHost: {echo_addr}\r\n\r\n");
    stream.write_all(connect.as_bytes()).await?;
    let mut got = vec![0u8; 39];
    stream.read_exact(&mut got).await?;

    // nothing flows; within ~1.5x the window both directions give up
    let mut buf = [0u8; 1];
    let res = timeout(Duration::from_secs(2), stream.read(&mut buf)).await;
    assert!(res.is_ok(), "tunnel outlived the idle timeout");
    Ok(())
}

/// Traffic at intervals well under the idle timeout never trips it.
#[tokio::test]
async fn steady_traffic_keeps_the_tunnel_alive() -> Result<()> {
    let config = ProxyConfig {
        allow: LOCAL_ALLOW.to_string(),
        idle_timeout: Duration::from_millis(300),
        ..ProxyConfig::default()
    };
    let (echo_addr, _echo_task) = spawn_echo_server().await?;
    let (proxy_addr, _proxy_task) = spawn_proxy(config).await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    let connect = format!("CONNECT {echo_addr} HTTP/1.1\r\nHost: {echo_addr}\r\n\r\n");
    stream.write_all(connect.as_bytes()).await?;
    let mut got = vec![0u8; 39];
    stream.read_exact(&mut got).await?;

    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        stream.write_all(b"x").await?;
        let mut echoed = [0u8; 1];
        timeout(Duration::from_secs(1), stream.read_exact(&mut echoed))
            .await
            .anyerr()??;
        assert_eq!(&echoed, b"x");
    }
    Ok(())
}

// -- Origin servers --

mod origin_server {
    use std::{
        convert::Infallible,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use http_body_util::{BodyExt, Full};
    use hyper::{
        Request, Response,
        body::{Bytes, Incoming},
        server::conn::http1,
        service::service_fn,
    };
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    /// Answers "{label} {METHOD} {PATH}", counting accepted connections.
    pub(super) async fn run(listener: TcpListener, label: &'static str, conns: Arc<AtomicUsize>) {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            conns.fetch_add(1, Ordering::SeqCst);
            let io = TokioIo::new(stream);
            tokio::task::spawn(async move {
                let handler = move |req: Request<Incoming>| async move {
                    let body = format!("{} {} {}", label, req.method(), req.uri().path());
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                };
                let _ = http1::Builder::new()
                    .serve_connection(io, service_fn(handler))
                    .await;
            });
        }
    }

    /// Answers "{label} {METHOD} {PATH}: {BODY}".
    pub(super) async fn run_echo_body(listener: TcpListener, label: &'static str) {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let io = TokioIo::new(stream);
            tokio::task::spawn(async move {
                let handler = move |req: Request<Incoming>| async move {
                    let method = req.method().clone();
                    let path = req.uri().path().to_string();
                    let body = req.collect().await.unwrap().to_bytes();
                    let body = String::from_utf8_lossy(&body);
                    let response = format!("{label} {method} {path}: {body}");
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(response))))
                };
                let _ = http1::Builder::new()
                    .serve_connection(io, service_fn(handler))
                    .await;
            });
        }
    }
}
