use gpt_bridge::net::Connector;
use gpt_bridge::session::{SESSION_TTL, SessionEntry};
use gpt_bridge::{BridgeError, HttpRequest, SessionPool, SessionRegistry, probe_session_token};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

/// Upstream that answers every probe with the same canned response
struct CookieUpstream {
    reply: &'static str,
    probes: AtomicUsize,
}

impl CookieUpstream {
    fn new(reply: &'static str) -> Self {
        Self {
            reply,
            probes: AtomicUsize::new(0),
        }
    }
}

impl Connector for CookieUpstream {
    type Transport = DuplexStream;

    fn connect(&self) -> impl Future<Output = gpt_bridge::Result<DuplexStream>> + Send {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let reply = self.reply;
        async move {
            let (client, mut server) = duplex(8192);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let _ = server.read(&mut buf).await;
                let _ = server.write_all(reply.as_bytes()).await;
            });
            Ok(client)
        }
    }
}

const WITH_COOKIE: &str = "HTTP/1.1 200 OK\r\n\
    Set-Cookie: locale=en; path=/\r\n\
    Set-Cookie: __cf_bm=Xy7.abc-123; path=/; expires=Sat, 01 Jan 2033 00:00:00 GMT; HttpOnly\r\n\
    Content-Length: 2\r\n\r\nok";

fn probe_request() -> HttpRequest {
    HttpRequest::get("you.example.com", "/")
}

#[tokio::test]
async fn test_probe_harvests_marked_cookie() {
    let upstream = CookieUpstream::new(WITH_COOKIE);
    let token = probe_session_token(&upstream, &probe_request(), "__cf_bm=")
        .await
        .unwrap();
    assert_eq!(token, "__cf_bm=Xy7.abc-123");
}

#[tokio::test]
async fn test_probe_without_marker_fails() {
    let upstream = CookieUpstream::new(WITH_COOKIE);
    let err = probe_session_token(&upstream, &probe_request(), "cf_clearance=")
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::SessionAcquireFailed(_)));
}

#[tokio::test]
async fn test_probe_rejected_status_fails() {
    let upstream = CookieUpstream::new(
        "HTTP/1.1 403 Forbidden\r\nSet-Cookie: __cf_bm=nope\r\nContent-Length: 0\r\n\r\n",
    );
    let err = probe_session_token(&upstream, &probe_request(), "__cf_bm=")
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::SessionAcquireFailed(_)));
}

#[tokio::test(start_paused = true)]
async fn test_pool_probes_only_on_miss() {
    let upstream = CookieUpstream::new(WITH_COOKIE);
    let pool = SessionPool::new();
    let request = probe_request();

    let first = pool
        .acquire(|| probe_session_token(&upstream, &request, "__cf_bm="))
        .await
        .unwrap();
    pool.release(first);

    let second = pool
        .acquire(|| probe_session_token(&upstream, &request, "__cf_bm="))
        .await
        .unwrap();
    assert_eq!(second.token, "__cf_bm=Xy7.abc-123");
    assert_eq!(upstream.probes.load(Ordering::SeqCst), 1);
    pool.release(second);

    // once the token ages out the next acquire probes again
    tokio::time::advance(SESSION_TTL).await;
    pool.acquire(|| probe_session_token(&upstream, &request, "__cf_bm="))
        .await
        .unwrap();
    assert_eq!(upstream.probes.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_registry_pools_follow_ttl() {
    let registry = SessionRegistry::with_ttl(Duration::from_secs(60));
    let pool = registry.pool("you");
    pool.release(SessionEntry::new("cookie"));

    tokio::time::advance(Duration::from_secs(59)).await;
    assert_eq!(registry.pool("you").len(), 1);

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(registry.pool("you").checkout().is_none());
}
