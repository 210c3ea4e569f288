use leaderkey_consul::{
    ConsulClient, ConsulConfig, ConsulError, DebugTransport, HttpRequest, HttpTransport,
    ReqwestTransport,
};
use reqwest::{Method, StatusCode, Url};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn capturing(inner: Arc<dyn HttpTransport>) -> (DebugTransport, Arc<Mutex<Vec<String>>>) {
    let dumps = Arc::new(Mutex::new(Vec::new()));
    let sink = dumps.clone();
    let transport =
        DebugTransport::wrap(inner).with_sink(move |dump| sink.lock().unwrap().push(dump.to_string()));
    (transport, dumps)
}

#[tokio::test]
async fn test_dumps_error_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500).set_body_string("rpc error"))
        .mount(&server)
        .await;

    let (transport, dumps) = capturing(Arc::new(ReqwestTransport::default()));
    let url = Url::parse(&format!("{}/", server.uri())).unwrap();

    let response = transport
        .send(HttpRequest::new(Method::GET, url))
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);

    let dumps = dumps.lock().unwrap();
    assert_eq!(dumps.len(), 2);
    assert!(dumps[0].starts_with("GET / HTTP/1.1\r\n"));
    assert!(dumps[1].starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    assert!(dumps[1].ends_with("rpc error"));
}

#[tokio::test]
async fn test_client_through_debug_transport() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500).set_body_string("No cluster leader"))
        .mount(&server)
        .await;

    let (transport, dumps) = capturing(Arc::new(ReqwestTransport::default()));
    let config = ConsulConfig::new().with_address(server.address().to_string());
    let client = ConsulClient::with_transport(config, Arc::new(transport)).unwrap();

    let error = client
        .get_key("svc/leader", None, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        ConsulError::UnexpectedStatus { status: 500, .. }
    ));

    let dumps = dumps.lock().unwrap();
    assert!(dumps[0].starts_with("GET /v1/kv/svc/leader HTTP/1.1\r\n"));
}

#[tokio::test]
async fn test_default_debug_transport_sends_requests() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .expect(1)
        .mount(&server)
        .await;

    let transport = DebugTransport::default();
    let url = Url::parse(&format!("{}/v1/kv/x", server.uri())).unwrap();
    let response = transport
        .send(HttpRequest::new(Method::GET, url))
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::OK);
}
