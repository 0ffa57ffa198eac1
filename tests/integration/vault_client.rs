//! Test: Vault KV reads over HTTP

use std::sync::mpsc;
use std::thread;

use stepconf::secrets::{KvSecretStore, SecretError, VaultClient};
use tiny_http::{Response, Server};

/// Request seen by the local Vault: URL and `X-Vault-Token` header
type Seen = (String, Option<String>);

/// Serve every request with `route` until the test ends
fn vault_server<F>(route: F) -> (String, mpsc::Receiver<Seen>)
where
    F: Fn(&str) -> (u16, String) + Send + 'static,
{
    let server = Server::http("127.0.0.1:0").unwrap();
    let addr = server.server_addr().to_ip().unwrap();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for request in server.incoming_requests() {
            let token = request
                .headers()
                .iter()
                .find(|h| h.field.equiv("X-Vault-Token"))
                .map(|h| h.value.as_str().to_string());
            let url = request.url().to_string();
            let (status, body) = route(&url);
            let _ = tx.send((url, token));
            let _ = request.respond(Response::from_string(body).with_status_code(status));
        }
    });
    (format!("http://{}", addr), rx)
}

#[tokio::test]
async fn test_reads_kv_v2_secret() {
    let (address, seen) = vault_server(|url| match url {
        "/v1/sys/internal/ui/mounts/secret/team/sonar" => (
            200,
            r#"{"data":{"path":"secret/","options":{"version":"2"}}}"#.to_string(),
        ),
        "/v1/secret/data/team/sonar" => (
            200,
            r#"{"data":{"data":{"token":"abc","port":9000},"metadata":{"version":3}}}"#.to_string(),
        ),
        _ => (404, "{}".to_string()),
    });

    let client = VaultClient::new(address, "vault-token");
    let data = client.get_kv_secret("/secret/team/sonar/").await.unwrap().unwrap();
    assert_eq!(data["token"], "abc");
    assert_eq!(data["port"], "9000");

    let requests: Vec<Seen> = seen.try_iter().collect();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].0, "/v1/secret/data/team/sonar");
    assert!(requests
        .iter()
        .all(|(_, token)| token.as_deref() == Some("vault-token")));
}

#[tokio::test]
async fn test_reads_kv_v1_secret() {
    let (address, _seen) = vault_server(|url| match url {
        "/v1/sys/internal/ui/mounts/kv/team/sonar" => {
            (200, r#"{"data":{"path":"kv/","options":null}}"#.to_string())
        }
        "/v1/kv/team/sonar" => (200, r#"{"data":{"token":"v1"}}"#.to_string()),
        _ => (404, "{}".to_string()),
    });

    let client = VaultClient::new(address, "t");
    let data = client.get_kv_secret("kv/team/sonar").await.unwrap().unwrap();
    assert_eq!(data["token"], "v1");
}

#[tokio::test]
async fn test_missing_secret_is_none() {
    let (address, _seen) = vault_server(|url| match url {
        "/v1/sys/internal/ui/mounts/secret/missing" => (
            200,
            r#"{"data":{"path":"secret/","options":{"version":"2"}}}"#.to_string(),
        ),
        _ => (404, r#"{"errors":[]}"#.to_string()),
    });

    let client = VaultClient::new(address, "t");
    assert!(client.get_kv_secret("secret/missing").await.unwrap().is_none());
}

#[tokio::test]
async fn test_denied_access_is_store_error() {
    let (address, _seen) = vault_server(|_| (403, r#"{"errors":["permission denied"]}"#.to_string()));

    let client = VaultClient::new(address, "t");
    let err = client.get_kv_secret("secret/team/sonar").await.unwrap_err();
    match err {
        SecretError::Store { path, message } => {
            assert!(path.ends_with("secret/team/sonar"));
            assert!(message.contains("403"));
        }
        other => panic!("unexpected error: {other}"),
    }
}
