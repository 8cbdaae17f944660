//! Request logging middleware, gated by `RequestsLoggingLevel` (`[AMBIENT] §11`).
//!
//! Mirrors the teacher's `requests_logging.rs` shape (level-ordered gating via
//! `PartialOrd`, request/response header and body dumps) but drops the
//! Prometheus bandwidth accounting the teacher records alongside it — this
//! crate carries no metrics backend. One deviation from the teacher: request
//! and response bodies on ZK-bearing routes are never dumped at `Body` level,
//! since spec §4.5 forbids `drk_jwe` from ever reaching the logs.

use crate::server::AppState;
use axum::{
    body::Body,
    extract::State,
    http::{header::HeaderMap, Request, Response},
    middleware::Next,
    response::IntoResponse,
};
use std::time::Instant;
use tracing::{error, info};

#[derive(PartialEq, PartialOrd, Clone, Debug, clap::ValueEnum)]
pub enum RequestsLoggingLevel {
    None,
    Path,
    Headers,
    Body,
}

impl Default for RequestsLoggingLevel {
    fn default() -> Self {
        Self::Path
    }
}

impl std::fmt::Display for RequestsLoggingLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

const MAX_LOGGABLE_BODY_LENGTH: usize = 1024;

/// Paths carrying `drk_jwe` in the request or response body; body-level
/// logging is suppressed for these regardless of the configured level.
const ZK_SENSITIVE_PATHS: &[&str] = &["/finalize", "/token"];

enum ContentLengthParseResult {
    Ok(usize),
    No(&'static str),
}

fn parse_content_length(headers: &HeaderMap) -> ContentLengthParseResult {
    let value = match headers.get("content-length") {
        Some(x) => x,
        None => return ContentLengthParseResult::No("Content-length not set."),
    };

    let str_value = match value.to_str() {
        Ok(x) => x,
        Err(_) => {
            return ContentLengthParseResult::No("Could not get Content-length string value.")
        }
    };

    match str_value.parse::<usize>() {
        Ok(x) => ContentLengthParseResult::Ok(x),
        Err(_) => ContentLengthParseResult::No("Could not parse Content-length numeric value."),
    }
}

pub async fn log_requests(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> impl IntoResponse {
    let level = state.config.logging_level.clone();
    let start = Instant::now();

    let method = request.method().to_string();
    let uri = request.uri().to_string();
    let path = request.uri().path().to_string();
    let zk_sensitive = ZK_SENSITIVE_PATHS.iter().any(|p| path == *p);

    if level > RequestsLoggingLevel::None {
        info!(">>> {} {}", method, uri);
    }

    if level >= RequestsLoggingLevel::Headers {
        info!("  Req Headers:");
        for header in request.headers().iter() {
            info!("    {:?}: {:?}", header.0, header.1);
        }
    }

    if level >= RequestsLoggingLevel::Body {
        if zk_sensitive {
            info!("  Req Body: redacted (zk-sensitive route)");
        } else {
            match parse_content_length(request.headers()) {
                ContentLengthParseResult::No(reason) => info!("  Req Body: {}", reason),
                ContentLengthParseResult::Ok(size) => {
                    if size < MAX_LOGGABLE_BODY_LENGTH {
                        let (parts, body) = request.into_parts();
                        let bytes = match axum::body::to_bytes(body, size).await {
                            Ok(bytes) => bytes,
                            Err(err) => {
                                error!("Failed to read request body: {:?}", err);
                                return Response::builder()
                                    .status(500)
                                    .body(Body::from("Internal Server Error"))
                                    .unwrap();
                            }
                        };
                        info!("  Req Body:\n{}", String::from_utf8_lossy(&bytes));
                        request = Request::from_parts(parts, Body::from(bytes))
                    } else {
                        info!("  Req Body: too big to log ({size} bytes)");
                    }
                }
            }
        }
    }

    let mut response = next.run(request).await;

    if level >= RequestsLoggingLevel::Headers {
        info!("  Resp Headers:");
        for header in response.headers().iter() {
            info!("    {:?}: {:?}", header.0, header.1);
        }
    }

    if level >= RequestsLoggingLevel::Body {
        if zk_sensitive {
            info!("  Resp Body: redacted (zk-sensitive route)");
        } else {
            match parse_content_length(response.headers()) {
                ContentLengthParseResult::No(reason) => info!("  Resp Body: {}", reason),
                ContentLengthParseResult::Ok(size) => {
                    if size < MAX_LOGGABLE_BODY_LENGTH {
                        let (parts, body) = response.into_parts();
                        let bytes = match axum::body::to_bytes(body, size).await {
                            Ok(bytes) => bytes,
                            Err(err) => {
                                error!("Failed to read response body: {:?}", err);
                                return Response::builder()
                                    .status(500)
                                    .body(Body::from("Internal Server Error"))
                                    .unwrap();
                            }
                        };
                        info!("  Resp Body:\n{}", String::from_utf8_lossy(&bytes));
                        response = Response::from_parts(parts, Body::from(bytes))
                    } else {
                        info!("  Resp Body: too big to log ({size} bytes)");
                    }
                }
            }
        }
    }

    let status = response.status().as_u16();
    let duration = start.elapsed();
    if level > RequestsLoggingLevel::None {
        info!("<<< {} ({}ms)", status, duration.as_millis());
    }

    response
}

#[cfg(test)]
mod tests {
    use super::RequestsLoggingLevel;

    #[test]
    fn level_ordering() {
        let none = RequestsLoggingLevel::None;

        assert!(none < RequestsLoggingLevel::Headers);
        assert!(RequestsLoggingLevel::Body > RequestsLoggingLevel::None);
    }
}
