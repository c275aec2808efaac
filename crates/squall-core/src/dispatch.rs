//! Dispatch pipeline: route lookup, authorization, POST admission,
//! handler invocation and the bounded rewrite loop
//!
//! Mirrors the order requests move through the server: longest-prefix
//! lookup, prefix strip, auth gate, slash trim, accept-encoding parse,
//! body read for POST, then the handler. A handler on a rewrite-capable
//! route may swap the URL and send the request around again, at most
//! four times.

use tokio::io::AsyncRead;
use tracing::trace;

use crate::body::{self, BodyStore};
use crate::config::ServerConfig;
use crate::connection::{calculate_n_packets, read_body};
use crate::error::{Error, Result};
use crate::parser::{Method, Span};
use crate::request::{Loc, Request, RequestFlags, Store};
use crate::response::Response;
use crate::router::{RouteTable, UrlMap};

/// Run `request` through the pipeline and return the handler's
/// response. `stream` is only touched when a POST body must be read.
pub(crate) async fn invoke<S>(
    request: &mut Request,
    stream: &mut S,
    table: &RouteTable,
    config: &ServerConfig,
) -> Result<Response>
where
    S: AsyncRead + Unpin,
{
    loop {
        let url_map = table.lookup_prefix(request.url()).ok_or(Error::NotFound)?;
        prepare_for_handler(request, url_map)?;

        if request.method() == Method::Post {
            if !url_map.flags.allow_post {
                return Err(Error::NotAllowed);
            }
            read_post_data(request, stream, config).await?;
        }

        let response = (url_map.handler())(request).await;

        if url_map.flags.can_rewrite && request.flags.contains(RequestFlags::URL_REWRITTEN) {
            trace!("handler rewrote URL, routing again");
            request.apply_rewrite()?;
            continue;
        }

        return Ok(response);
    }
}

fn prepare_for_handler(request: &mut Request, url_map: &UrlMap) -> Result<()> {
    request.strip_url_prefix(url_map.prefix().len());

    if let Some(auth) = url_map.auth() {
        if !auth.check(request.authorization()) {
            return Err(Error::NotAuthorized {
                realm: auth.realm().to_string(),
            });
        }
    }

    if url_map.flags.remove_leading_slash {
        request.remove_leading_slashes();
    }

    if url_map.flags.parse_accept_encoding {
        request.parse_accept_encoding();
    }

    Ok(())
}

/// Admit and read a POST body.
///
/// The declared length is checked against the configured cap before
/// anything is allocated. Body bytes that already sit in the request
/// buffer are used as-is when complete (the pipelined fast path) or
/// copied to the front of a fresh body buffer otherwise, with the rest
/// streamed in under a wall-clock deadline and a packet budget.
async fn read_post_data<S>(
    request: &mut Request,
    stream: &mut S,
    config: &ServerConfig,
) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let length = request.helper.content_length;
    if length.is_empty() {
        return Err(Error::BadRequest);
    }
    let text =
        std::str::from_utf8(length.slice(request.buf.bytes())).map_err(|_| Error::BadRequest)?;
    let declared: i64 = text.trim().parse().map_err(|_| Error::BadRequest)?;
    if declared < 0 {
        return Err(Error::BadRequest);
    }
    let size = declared as usize;
    if size >= config.max_post_data_size {
        return Err(Error::TooLarge);
    }

    if size == 0 {
        request.body = BodyStore::Inline(Span::EMPTY);
        return Ok(());
    }

    if let Some(offset) = request.helper.next_request {
        let have = request.buf.filled() - offset;
        if have >= size {
            // Fast path: the body arrived with the headers
            let span = Span::new(offset, size);
            request.body = BodyStore::Inline(span);
            request.helper.post_data = Loc {
                store: Store::Head,
                span,
            };
            let after = offset + size;
            request.helper.next_request = if after < request.buf.filled() {
                Some(after)
            } else {
                None
            };
            return Ok(());
        }
    }

    let mut buffer = body::alloc(size, config.allow_post_temp_file)?;

    let have = match request.helper.next_request.take() {
        Some(offset) => {
            let have = request.buf.filled() - offset;
            buffer.as_mut_slice()[..have].copy_from_slice(&request.buf.bytes()[offset..]);
            have
        }
        None => 0,
    };

    let deadline = tokio::time::Instant::now() + config.keep_alive_timeout;
    let budget = calculate_n_packets(size);
    read_body(stream, buffer.as_mut_slice(), have, deadline, budget).await?;

    request.helper.post_data = Loc {
        store: Store::Body,
        span: Span::new(0, size),
    };
    request.body = BodyStore::Buffered(buffer);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestBuffer;
    use crate::response::StatusCode;
    use crate::router::{handler_fn, HandlerFuture, UrlMap};

    fn ok_handler(_req: &mut Request) -> HandlerFuture<'_> {
        Box::pin(async { Response::ok() })
    }

    fn url_echo_handler(req: &mut Request) -> HandlerFuture<'_> {
        Box::pin(async move { Response::text(req.url().to_vec()) })
    }

    fn rewrite_handler(req: &mut Request) -> HandlerFuture<'_> {
        Box::pin(async move {
            req.rewrite_url("/loop".to_string());
            Response::ok()
        })
    }

    fn request(input: &[u8]) -> Request {
        Request::parse(RequestBuffer::from_slice(input), 0, None, None)
            .unwrap_or_else(|_| panic!("parse failed"))
    }

    async fn run(table: &RouteTable, input: &[u8]) -> Result<Response> {
        let mut req = request(input);
        let (_, mut empty) = tokio::io::duplex(64);
        invoke(&mut req, &mut empty, table, &ServerConfig::default()).await
    }

    #[tokio::test]
    async fn test_not_found() {
        let mut table = RouteTable::new();
        table.insert(UrlMap::new("/app", handler_fn(ok_handler)));
        let result = run(&table, b"GET /missing HTTP/1.1\r\n\r\n").await;
        assert!(matches!(result, Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn test_prefix_stripped_before_handler() {
        let mut table = RouteTable::new();
        table.insert(UrlMap::new("/admin", handler_fn(url_echo_handler)));
        let response = run(&table, b"GET /admin/users HTTP/1.1\r\n\r\n").await.unwrap();
        assert_eq!(&response.body[..], b"/users");
    }

    #[tokio::test]
    async fn test_post_to_non_post_route() {
        let mut table = RouteTable::new();
        table.insert(UrlMap::new("/", handler_fn(ok_handler)));
        let result = run(
            &table,
            b"POST / HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc",
        )
        .await;
        assert!(matches!(result, Err(Error::NotAllowed)));
    }

    #[tokio::test]
    async fn test_post_requires_content_length() {
        let mut table = RouteTable::new();
        table.insert(UrlMap::new("/", handler_fn(ok_handler)).allow_post());
        let result = run(&table, b"POST / HTTP/1.1\r\n\r\n").await;
        assert!(matches!(result, Err(Error::BadRequest)));
    }

    #[tokio::test]
    async fn test_post_size_cap() {
        let mut table = RouteTable::new();
        table.insert(UrlMap::new("/", handler_fn(ok_handler)).allow_post());
        let result = run(
            &table,
            b"POST / HTTP/1.1\r\nContent-Length: 1073741824\r\n\r\n",
        )
        .await;
        assert!(matches!(result, Err(Error::TooLarge)));
    }

    #[tokio::test]
    async fn test_post_body_inline_fast_path() {
        fn form_handler(req: &mut Request) -> HandlerFuture<'_> {
            Box::pin(async move {
                let a = req.post_param(b"a").unwrap_or(b"?").to_vec();
                let b = req.post_param(b"b").unwrap_or(b"?").to_vec();
                let body_len = req.body().len();
                Response::text(format!(
                    "a={} b={} len={}",
                    String::from_utf8_lossy(&a),
                    String::from_utf8_lossy(&b),
                    body_len
                ))
            })
        }

        let mut table = RouteTable::new();
        table.insert(UrlMap::new("/f", handler_fn(form_handler)).allow_post());
        let response = run(
            &table,
            b"POST /f HTTP/1.1\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\
              Content-Length: 7\r\n\r\n\
              a=1&b=2",
        )
        .await
        .unwrap();
        assert_eq!(&response.body[..], b"a=1 b=2 len=7");
    }

    #[tokio::test]
    async fn test_rewrite_loop_capped() {
        let mut table = RouteTable::new();
        table.insert(UrlMap::new("/", handler_fn(rewrite_handler)).can_rewrite());
        let result = run(&table, b"GET /start HTTP/1.1\r\n\r\n").await;
        assert!(matches!(result, Err(Error::Internal(_))));
    }

    #[tokio::test]
    async fn test_rewrite_reroutes() {
        fn bounce_handler(req: &mut Request) -> HandlerFuture<'_> {
            Box::pin(async move {
                if req.url() == b"/old" {
                    req.rewrite_url("/new".to_string());
                    return Response::ok();
                }
                Response::text(req.url().to_vec())
            })
        }

        let mut table = RouteTable::new();
        table.insert(UrlMap::new("", handler_fn(bounce_handler)).can_rewrite());
        let response = run(&table, b"GET /old HTTP/1.1\r\n\r\n").await.unwrap();
        assert_eq!(&response.body[..], b"/new");
        assert_eq!(response.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_auth_gate() {
        use std::collections::HashMap;

        let mut users = HashMap::new();
        users.insert("user".to_string(), "pass".to_string());
        let auth = crate::auth::BasicAuth::new("secret", users);

        let mut table = RouteTable::new();
        table.insert(UrlMap::new("/private", handler_fn(ok_handler)).with_auth(auth));

        let denied = run(&table, b"GET /private HTTP/1.1\r\n\r\n").await;
        assert!(matches!(denied, Err(Error::NotAuthorized { realm }) if realm == "secret"));

        // base64("user:pass")
        let allowed = run(
            &table,
            b"GET /private HTTP/1.1\r\nAuthorization: Basic dXNlcjpwYXNz\r\n\r\n",
        )
        .await
        .unwrap();
        assert_eq!(allowed.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_accept_encoding_parsed_when_flagged() {
        fn encoding_handler(req: &mut Request) -> HandlerFuture<'_> {
            Box::pin(async move {
                Response::text(format!(
                    "gzip={} deflate={}",
                    req.accepts_gzip(),
                    req.accepts_deflate()
                ))
            })
        }

        let mut table = RouteTable::new();
        table.insert(UrlMap::new("/", handler_fn(encoding_handler)).parse_accept_encoding());
        let response = run(
            &table,
            b"GET / HTTP/1.1\r\nAccept-Encoding: deflate\r\n\r\n",
        )
        .await
        .unwrap();
        assert_eq!(&response.body[..], b"gzip=false deflate=true");
    }
}
