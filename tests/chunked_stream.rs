use bytes::Bytes;
use gpt_bridge::driver::{drive, send_request};
use gpt_bridge::{BridgeError, HttpRequest};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

/// Reply to one request by writing `parts` with a short pause between them
fn trickle(parts: Vec<&'static str>) -> DuplexStream {
    let (client, mut server) = duplex(64 * 1024);
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        let _ = server.read(&mut buf).await;
        for part in parts {
            if server.write_all(part.as_bytes()).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });
    client
}

fn request() -> HttpRequest {
    HttpRequest::post("chat.example.com", "/backend-api/conversation")
        .header("Accept", "text/event-stream")
        .unwrap()
        .body(r#"{"prompt":"hi"}"#)
}

#[tokio::test]
async fn test_chunks_split_across_reads() {
    let transport = trickle(vec![
        "HTTP/1.1 200 OK\r\nTransfer-",
        "Encoding: chunked\r\n\r\n",
        "1",
        "6\r\ndata: {\"token\":",
        "\"Hel\"}\n\r\n",
        "14\r\ndata: {\"token\":\"lo\"}",
        "\r\n0\r\n",
        "\r\n",
    ]);

    let mut fragments = Vec::new();
    let summary = drive(transport, &request(), 200, |piece| fragments.push(piece))
        .await
        .unwrap();

    let body = fragments.concat();
    assert_eq!(
        String::from_utf8(body).unwrap(),
        "data: {\"token\":\"Hel\"}\ndata: {\"token\":\"lo\"}"
    );
    assert!(summary.fragments >= 2);
    assert_eq!(summary.bytes, 42);
}

#[tokio::test]
async fn test_non_expected_status_yields_no_fragments() {
    let transport = trickle(vec![
        "HTTP/1.1 403 Forbidden\r\nTransfer-Encoding: chunked\r\n\r\n",
        "9\r\nforbidden\r\n0\r\n\r\n",
    ]);

    let mut fragments: Vec<Bytes> = Vec::new();
    let err = drive(transport, &request(), 200, |piece| fragments.push(piece))
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "Unexpected http status code: 403(Forbidden)");
    assert!(fragments.is_empty());
}

#[tokio::test]
async fn test_chunk_extensions_and_trailers() {
    let transport = trickle(vec![
        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n",
        "4;name=value\r\nwiki\r\n5\r\npedia\r\n0\r\nExpires: never\r\n\r\n",
    ]);

    let mut fragments = Vec::new();
    drive(transport, &request(), 200, |piece| fragments.push(piece))
        .await
        .unwrap();
    assert_eq!(fragments.concat(), b"wikipedia");
}

#[tokio::test]
async fn test_content_length_body() {
    let transport = trickle(vec![
        "HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nhello",
        " world",
    ]);

    let mut fragments = Vec::new();
    let summary = drive(transport, &request(), 200, |piece| fragments.push(piece))
        .await
        .unwrap();
    assert_eq!(fragments.concat(), b"hello world");
    assert_eq!(summary.bytes, 11);
}

#[tokio::test]
async fn test_close_delimited_body() {
    let transport = trickle(vec![
        "HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n",
        "streamed ",
        "until close",
    ]);

    let mut fragments = Vec::new();
    drive(transport, &request(), 200, |piece| fragments.push(piece))
        .await
        .unwrap();
    assert_eq!(fragments.concat(), b"streamed until close");
}

#[tokio::test]
async fn test_bad_chunk_size_is_protocol_error() {
    let transport = trickle(vec![
        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n",
        "zz\r\nnope\r\n",
    ]);

    let err = drive(transport, &request(), 200, |_| {}).await.unwrap_err();
    assert!(matches!(err, BridgeError::Protocol(_)));
}

#[tokio::test]
async fn test_response_head_before_body() {
    let transport = trickle(vec![
        "HTTP/1.1 201 Created\r\nX-Request-Id: abc\r\nContent-Length: 2\r\n\r\n",
        "ok",
    ]);

    let response = send_request(transport, &request()).await.unwrap();
    assert_eq!(response.head.status, 201);
    assert_eq!(response.head.header("x-request-id"), Some("abc"));
    assert_eq!(&response.body.collect().await.unwrap()[..], b"ok");
}
