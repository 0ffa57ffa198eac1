//! Test: Trust service token requests over HTTP

use std::io::Read;
use std::sync::mpsc;
use std::thread;

use stepconf::secrets::{SecretError, TokenIssuer, TrustClient, TrustConfig};
use tiny_http::{Response, Server};

#[derive(Debug)]
struct SeenRequest {
    method: String,
    url: String,
    authorization: Option<String>,
    body: serde_json::Value,
}

/// Answer one request with `status` and `body`
fn trust_server(status: u16, body: &'static str) -> (String, mpsc::Receiver<SeenRequest>) {
    let server = Server::http("127.0.0.1:0").unwrap();
    let addr = server.server_addr().to_ip().unwrap();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        if let Ok(mut request) = server.recv() {
            let mut raw = String::new();
            let _ = request.as_reader().read_to_string(&mut raw);
            let seen = SeenRequest {
                method: request.method().to_string(),
                url: request.url().to_string(),
                authorization: request
                    .headers()
                    .iter()
                    .find(|h| h.field.equiv("Authorization"))
                    .map(|h| h.value.as_str().to_string()),
                body: serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null),
            };
            let _ = tx.send(seen);
            let _ = request.respond(Response::from_string(body).with_status_code(status));
        }
    });
    (format!("http://{}", addr), rx)
}

fn client(server_url: String, query_param: &str) -> TrustClient {
    TrustClient::new(TrustConfig {
        server_url,
        token_end_point: "tokens".to_string(),
        token_query_param_name: query_param.to_string(),
        token: "pipeline-token".to_string(),
    })
}

#[tokio::test]
async fn test_issues_tokens() {
    let (url, seen) = trust_server(200, r#"{"sonar":"issued"}"#);

    let tokens = client(url, "systems")
        .issue_tokens(&["sonar".to_string()])
        .await
        .unwrap();
    assert_eq!(tokens.get("sonar").map(String::as_str), Some("issued"));

    let request = seen.recv().unwrap();
    assert_eq!(request.method, "POST");
    assert_eq!(request.url, "/tokens?systems=sonar");
    assert_eq!(request.authorization.as_deref(), Some("Bearer pipeline-token"));
    assert_eq!(
        request.body,
        serde_json::json!([{"system": "sonar", "scope": "pipeline"}])
    );
}

#[tokio::test]
async fn test_server_error_is_http_error() {
    let (url, _seen) = trust_server(500, "boom");

    let err = client(url, "")
        .issue_tokens(&["sonar".to_string()])
        .await
        .unwrap_err();
    match err {
        SecretError::Http { url, message } => {
            assert!(url.ends_with("/tokens"));
            assert!(message.contains("500"));
        }
        other => panic!("unexpected error: {other}"),
    }
}
