#![forbid(unsafe_code)]

use std::time::Duration;

use meshsync_core::{ConfigEntry, MeshRegistration, Placement};
use meshsync_mesh::{HttpMeshClient, MeshApi, MeshConnection, TokenQuery};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Serves one canned response per connection, in order, and returns the
/// raw request heads it saw.
async fn canned(responses: Vec<(u16, &'static str)>) -> (MeshConnection, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let mut seen = Vec::new();
        for (status, body) in responses {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            let head_end = loop {
                let n = sock.read(&mut chunk).await.unwrap();
                assert!(n > 0, "client closed before sending a request");
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };
            let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
            let content_length = head
                .lines()
                .find_map(|l| {
                    let (k, v) = l.split_once(':')?;
                    k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse::<usize>().ok())?
                })
                .unwrap_or(0);
            while buf.len() < head_end + content_length {
                let n = sock.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            let body_in = String::from_utf8_lossy(&buf[head_end..]).to_string();
            seen.push(format!("{head}{body_in}"));

            let reply = format!(
                "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            sock.write_all(reply.as_bytes()).await.unwrap();
            sock.shutdown().await.ok();
        }
        seen
    });
    let mut conn = MeshConnection::new("127.0.0.1");
    conn.http_port = port;
    conn.token = Some("s3cr3t".into());
    conn.api_timeout = Duration::from_secs(2);
    (conn, handle)
}

#[tokio::test]
async fn token_listing_is_consistent_and_authenticated() {
    let body = r#"[{"AccessorID":"a1","AuthMethod":"k8s","Description":"token created via login: {\"pod\":\"ns1/pod-a\"}","CreateTime":"2024-03-01T10:00:00.123456Z"},{"AccessorID":"a2","Description":""}]"#;
    let (conn, server) = canned(vec![(200, body)]).await;
    let client = HttpMeshClient::new(&conn).unwrap();
    let placement = Placement { namespace: Some("*".into()), partition: None };
    let tokens = client.list_tokens(&TokenQuery::new("k8s", placement)).await.unwrap();

    assert_eq!(tokens.len(), 2);
    assert_eq!(tokens[0].accessor_id, "a1");
    assert_eq!(tokens[0].auth_method, "k8s");
    assert!(tokens[0].create_time.is_some());
    assert_eq!(tokens[1].description, "");

    let seen = server.await.unwrap();
    let req = seen[0].to_ascii_lowercase();
    assert!(req.starts_with("get /v1/acl/tokens?"), "{req}");
    assert!(req.contains("authmethod=k8s"));
    assert!(req.contains("consistent"));
    assert!(req.contains("ns=%2a") || req.contains("ns=*"));
    assert!(req.contains("x-consul-token: s3cr3t"));
}

#[tokio::test]
async fn revoking_a_missing_token_succeeds() {
    let (conn, server) = canned(vec![(404, "")]).await;
    let client = HttpMeshClient::new(&conn).unwrap();
    client.revoke_token("gone-1", &Placement::default()).await.unwrap();
    let seen = server.await.unwrap();
    assert!(seen[0].starts_with("DELETE /v1/acl/token/gone-1"));
}

#[tokio::test]
async fn unknown_caller_token_is_not_mistaken_for_a_revoked_one() {
    let (conn, _server) = canned(vec![(403, "rpc error making call: ACL not found")]).await;
    let client = HttpMeshClient::new(&conn).unwrap();
    let err = client.revoke_token("a1", &Placement::default()).await.unwrap_err();
    assert!(err.is_fatal(), "{err}");
}

#[tokio::test]
async fn permission_denied_is_fatal_and_server_errors_are_not() {
    let (conn, _server) = canned(vec![(403, "Permission denied"), (503, "no leader")]).await;
    let client = HttpMeshClient::new(&conn).unwrap();
    let err = client.revoke_token("a1", &Placement::default()).await.unwrap_err();
    assert!(err.is_fatal(), "{err}");
    let reg = MeshRegistration::new("node-1", "web", "web-1");
    let err = client.register(&reg).await.unwrap_err();
    assert!(!err.is_fatal() && !err.is_not_found(), "{err}");
}

#[tokio::test]
async fn undecodable_listing_is_a_protocol_error() {
    let (conn, _server) = canned(vec![(200, "{not json")]).await;
    let client = HttpMeshClient::new(&conn).unwrap();
    let err = client.list_tokens(&TokenQuery::new("k8s", Placement::default())).await.unwrap_err();
    assert!(matches!(err, meshsync_core::Error::Protocol(_)), "{err}");
}

#[tokio::test]
async fn register_puts_the_catalog_body() {
    let (conn, server) = canned(vec![(200, "true")]).await;
    let client = HttpMeshClient::new(&conn).unwrap();
    let mut reg = MeshRegistration::new("node-1", "web", "web-1");
    reg.port = Some(80);
    client.register(&reg).await.unwrap();
    let seen = server.await.unwrap();
    assert!(seen[0].starts_with("PUT /v1/catalog/register"));
    assert!(seen[0].contains(r#""ID":"web-1""#));
    assert!(seen[0].contains(r#""SkipNodeUpdate":true"#));
}

#[tokio::test]
async fn unreachable_server_is_transient() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let mut conn = MeshConnection::new("127.0.0.1");
    conn.http_port = port;
    let client = HttpMeshClient::new(&conn).unwrap();
    let err = client.list_tokens(&TokenQuery::new("k8s", Placement::default())).await.unwrap_err();
    assert!(!err.is_fatal() && !err.is_not_found(), "{err}");
}

#[tokio::test]
async fn config_entry_is_put_with_kind_and_name_inline() {
    let (conn, server) = canned(vec![(200, "true")]).await;
    let client = HttpMeshClient::new(&conn).unwrap();
    let mut payload = serde_json::Map::new();
    payload.insert("Protocol".into(), "http".into());
    let entry = ConfigEntry {
        kind: "service-defaults".into(),
        name: "web".into(),
        payload,
        placement: Placement { namespace: Some("ns1".into()), partition: None },
    };
    client.set_config_entry(&entry).await.unwrap();

    let seen = server.await.unwrap();
    assert!(seen[0].starts_with("PUT /v1/config "), "{}", seen[0]);
    assert!(seen[0].contains(r#""Kind":"service-defaults""#));
    assert!(seen[0].contains(r#""Name":"web""#));
    assert!(seen[0].contains(r#""Protocol":"http""#));
    assert!(seen[0].contains(r#""Namespace":"ns1""#));
}
