// Habitat - Terrarium temperature, humidity, and water level monitor
//
// Copyright 2023 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use hyper::body::Bytes;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request};
use hyper_rustls::HttpsConnector;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use serde::Serialize;
use std::error::Error;
use std::fmt::{self, Formatter};
use std::sync::Arc;
use std::time::Duration;

const TEXT_FORMAT: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";
const JSON_FORMAT: &str = "application/json";

/// Global state shared between all HTTP requests via Arc.
pub struct RequestState {
    pub registry: Registry,
}

/// Render Prometheus metrics from a registry in the text exposition format. If an
/// error is encountered, an HTTP 500 will be returned and the error will be logged.
pub async fn text_metrics_handler(State(state): State<Arc<RequestState>>) -> Response {
    let mut buf = String::new();

    match encode(&mut buf, &state.registry) {
        Ok(_) => {
            tracing::debug!(message = "encoded prometheus metrics to text format", bytes = buf.len());
            ([(CONTENT_TYPE, TEXT_FORMAT)], buf).into_response()
        }
        Err(e) => {
            tracing::error!(message = "error encoding metrics to text format", error = %e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Client for outbound requests to the notification service and time-series backend.
pub type HttpsClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Create a client that speaks HTTP/1 over TLS (verified against the bundled Mozilla trust
/// roots) or plain HTTP depending on the scheme of each request.
pub fn https_client() -> HttpsClient {
    let connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .build();

    Client::builder().build(connector)
}

/// Error making an outbound HTTP request.
#[derive(Debug)]
pub enum HttpError {
    Encode(serde_json::Error),
    Request(hyper::http::Error),
    Transport(hyper::Error),
    Timeout(Duration),
}

impl HttpError {
    pub fn as_label(&self) -> &'static str {
        match self {
            HttpError::Encode(_) => "encode",
            HttpError::Request(_) => "request",
            HttpError::Transport(_) => "transport",
            HttpError::Timeout(_) => "timeout",
        }
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            HttpError::Encode(e) => write!(f, "unable to encode request body: {}", e),
            HttpError::Request(e) => write!(f, "unable to build request: {}", e),
            HttpError::Transport(e) => write!(f, "request failed: {}", e),
            HttpError::Timeout(d) => write!(f, "no response within {:?}", d),
        }
    }
}

impl Error for HttpError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            HttpError::Encode(e) => Some(e),
            HttpError::Request(e) => Some(e),
            HttpError::Transport(e) => Some(e),
            HttpError::Timeout(_) => None,
        }
    }
}

/// Status and complete body of a response.
#[derive(Debug)]
pub struct JsonResponse {
    pub status: hyper::StatusCode,
    pub body: Bytes,
}

/// Send `body` encoded as JSON and read the entire response, giving up if the
/// exchange takes longer than `timeout`.
pub async fn send_json<T>(
    client: &HttpsClient,
    method: Method,
    uri: &str,
    body: &T,
    timeout: Duration,
) -> Result<JsonResponse, HttpError>
where
    T: Serialize + ?Sized,
{
    let payload = serde_json::to_vec(body).map_err(HttpError::Encode)?;
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .header(CONTENT_TYPE, JSON_FORMAT)
        .body(Body::from(payload))
        .map_err(HttpError::Request)?;

    let exchange = async {
        let res = client.request(req).await?;
        let status = res.status();
        let body = hyper::body::to_bytes(res.into_body()).await?;
        Ok::<_, hyper::Error>(JsonResponse { status, body })
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| HttpError::Timeout(timeout))?
        .map_err(HttpError::Transport)
}

#[cfg(test)]
pub(crate) mod test {
    use super::{https_client, send_json, text_metrics_handler, HttpError, RequestState};
    use axum::extract::State;
    use axum::http::header::CONTENT_TYPE;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Method, Request, Response, Server, StatusCode};
    use prometheus_client::metrics::counter::Counter;
    use prometheus_client::registry::Registry;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// A request received by a server started with `spawn_server`.
    #[derive(Debug, Clone)]
    pub(crate) struct Recorded {
        pub(crate) method: Method,
        pub(crate) path: String,
        pub(crate) body: serde_json::Value,
    }

    /// Start an HTTP server on a random local port that answers every request using
    /// `respond` and records what it was sent. Returns the base URL of the server.
    pub(crate) fn spawn_server<F>(respond: F) -> (String, Arc<Mutex<Vec<Recorded>>>)
    where
        F: Fn(&Method, &str) -> (StatusCode, String) + Send + Sync + 'static,
    {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let respond = Arc::new(respond);
        let recorded = requests.clone();

        let make = make_service_fn(move |_| {
            let respond = respond.clone();
            let recorded = recorded.clone();

            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let respond = respond.clone();
                    let recorded = recorded.clone();

                    async move {
                        let method = req.method().clone();
                        let path = req.uri().path().to_owned();
                        let bytes = hyper::body::to_bytes(req.into_body()).await?;
                        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);

                        let (status, reply) = respond(&method, &path);
                        recorded.lock().unwrap().push(Recorded { method, path, body });
                        Ok::<_, hyper::Error>(Response::builder().status(status).body(Body::from(reply)).unwrap())
                    }
                }))
            }
        });

        let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
        let server = Server::bind(&addr).serve(make);
        let url = format!("http://{}", server.local_addr());
        tokio::spawn(server);

        (url, requests)
    }

    #[tokio::test]
    async fn test_send_json() {
        let (url, requests) = spawn_server(|_, _| (StatusCode::CREATED, "{\"ok\":true}".to_owned()));
        let client = https_client();

        let res = send_json(
            &client,
            Method::PUT,
            &format!("{}/things/1", url),
            &serde_json::json!({"name": "thing"}),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(StatusCode::CREATED, res.status);
        assert_eq!(&b"{\"ok\":true}"[..], &res.body[..]);

        let recorded = requests.lock().unwrap();
        assert_eq!(1, recorded.len());
        assert_eq!(Method::PUT, recorded[0].method);
        assert_eq!("/things/1", recorded[0].path);
        assert_eq!(serde_json::json!({"name": "thing"}), recorded[0].body);
    }

    #[tokio::test]
    async fn test_send_json_timeout() {
        // Accept connections but never answer them
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let client = https_client();
        let res = send_json(
            &client,
            Method::POST,
            &format!("http://{}/", addr),
            &serde_json::json!({}),
            Duration::from_millis(100),
        )
        .await;

        assert!(matches!(res, Err(HttpError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_send_json_bad_uri() {
        let client = https_client();
        let res = send_json(&client, Method::POST, "not a uri", &(), Duration::from_secs(1)).await;

        assert_eq!("request", res.unwrap_err().as_label());
    }

    #[tokio::test]
    async fn test_text_metrics_handler() {
        let mut registry = Registry::default();
        let counter: Counter = Counter::default();
        counter.inc();
        registry.register("habitat_test", "Test counter", counter);

        let state = Arc::new(RequestState { registry });
        let res = text_metrics_handler(State(state)).await;

        assert_eq!(StatusCode::OK, res.status());
        assert!(res.headers()[CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("application/openmetrics-text"));

        let body = hyper::body::to_bytes(res.into_body()).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("habitat_test_total 1"));
    }
}
