// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP surface: the webhook source (`POST`) and the metrics endpoint (`GET /metrics`).

use crate::constants::SERVER_HEADER;
use crate::errors::EngineError;
use crate::message::{AckToken, LogMessage};
use crate::source::Ingress;
use crate::stats::StatsRegistry;
use crate::window::WindowHandle;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, SERVER};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

pub const METRICS_ENDPOINT_PATH: &str = "/metrics";

type HttpResponse = Response<Full<Bytes>>;

/// Posts request bodies as messages, one window slot each.
#[derive(Clone, Debug)]
pub struct Webhook {
    pub window: WindowHandle,
    pub ingress: Ingress,
    pub auth_token: Option<String>,
}

/// Routes served by one [`HttpServer`].
#[derive(Clone, Default)]
pub struct Routes {
    pub webhook: Option<Webhook>,
    pub metrics: Option<Arc<StatsRegistry>>,
}

pub struct HttpServer {
    listener: TcpListener,
    routes: Arc<Routes>,
    cancel: CancellationToken,
}

impl HttpServer {
    pub async fn bind(
        address: &str,
        routes: Routes,
        cancel: CancellationToken,
    ) -> Result<Self, EngineError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| EngineError::Bind {
                address: address.to_string(),
                source,
            })?;
        Ok(Self {
            listener,
            routes: Arc::new(routes),
            cancel,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) {
        debug!(address = ?self.listener.local_addr().ok(), "HTTP server started");
        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = tokio::task::JoinSet::new();

        loop {
            let conn = tokio::select! {
                () = self.cancel.cancelled() => break,
                con_res = self.listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("HTTP server error: {e}");
                        continue;
                    }
                    Ok((conn, _)) => conn,
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        error!("Connection handler panicked: {:?}", e);
                        continue;
                    },
                    Ok(()) | Err(_) => continue,
                },
            };

            let conn = TokioIo::new(conn);
            let server = server.clone();
            let routes = Arc::clone(&self.routes);
            let service = service_fn(move |req| {
                let routes = Arc::clone(&routes);
                async move { Ok::<_, Infallible>(handle_request(req, &routes).await) }
            });
            joinset.spawn(async move {
                if let Err(e) = server.serve_connection(conn, service).await {
                    debug!("Connection error: {e}");
                }
            });
        }

        joinset.shutdown().await;
        debug!("HTTP server stopped");
    }
}

async fn handle_request(req: Request<Incoming>, routes: &Routes) -> HttpResponse {
    match (req.method(), req.uri().path(), routes) {
        (&Method::GET, METRICS_ENDPOINT_PATH, Routes { metrics: Some(stats), .. }) => {
            match stats.render() {
                Ok(text) => Response::builder()
                    .status(StatusCode::OK)
                    .header(CONTENT_TYPE, "text/plain; version=0.0.4")
                    .header(SERVER, SERVER_HEADER)
                    .body(Full::new(Bytes::from(text)))
                    .unwrap_or_else(|_| plain_status(StatusCode::INTERNAL_SERVER_ERROR)),
                Err(e) => {
                    error!("Failed to render metrics: {e}");
                    status_response(StatusCode::INTERNAL_SERVER_ERROR, "error")
                }
            }
        }
        (&Method::POST, _, Routes { webhook: Some(webhook), metrics }) => {
            post_message(req, webhook, metrics.as_deref()).await
        }
        _ => status_response(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn post_message(
    req: Request<Incoming>,
    webhook: &Webhook,
    stats: Option<&StatsRegistry>,
) -> HttpResponse {
    if let Some(token) = &webhook.auth_token {
        let expected = format!("Bearer {token}");
        let authorized = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value == expected);
        if !authorized {
            return status_response(StatusCode::UNAUTHORIZED, "unauthorized");
        }
    }

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!("Failed to read webhook body: {e}");
            return status_response(StatusCode::BAD_REQUEST, "bad request");
        }
    };

    if !webhook.window.consume(1) {
        return status_response(StatusCode::SERVICE_UNAVAILABLE, "flow-controlled");
    }
    if let Some(stats) = stats {
        stats.input_event();
    }

    let msg = LogMessage::with_ack(body, AckToken::new(webhook.window.clone()));
    let mut ingress = webhook.ingress.clone();
    match ingress.push(msg).await {
        Ok(()) => status_response(StatusCode::OK, "received"),
        Err(_) => status_response(StatusCode::SERVICE_UNAVAILABLE, "stopped"),
    }
}

fn status_response(status: StatusCode, text: &str) -> HttpResponse {
    let body = json!({ "status": text }).to_string();
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .header(SERVER, SERVER_HEADER)
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| plain_status(status))
}

fn plain_status(status: StatusCode) -> HttpResponse {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}
