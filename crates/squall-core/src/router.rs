//! URL-map table with byte-wise longest-prefix lookup
//!
//! Routing matches the longest registered prefix of the decoded URL,
//! not path segments: `/admin` matches `/admin-panel` too. Each map
//! carries the per-route switches the dispatch pipeline consults.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::auth::BasicAuth;
use crate::request::Request;
use crate::response::Response;

/// Future returned by a handler; borrows the request it serves.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Response> + Send + 'a>>;

/// A route handler.
pub type Handler = Arc<dyn for<'a> Fn(&'a mut Request) -> HandlerFuture<'a> + Send + Sync>;

/// Wrap a plain handler function.
pub fn handler_fn(f: for<'a> fn(&'a mut Request) -> HandlerFuture<'a>) -> Handler {
    Arc::new(f)
}

/// Per-route switches consulted by the dispatch pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteFlags {
    /// Trim repeated leading `/` after the prefix strip
    pub remove_leading_slash: bool,
    /// Populate the gzip/deflate flags before the handler runs
    pub parse_accept_encoding: bool,
    /// Accept POST and read the body before the handler runs
    pub allow_post: bool,
    /// Re-route when the handler rewrites the URL
    pub can_rewrite: bool,
}

/// One routing entry: a URL prefix, its handler and its switches.
pub struct UrlMap {
    prefix: String,
    handler: Handler,
    pub flags: RouteFlags,
    auth: Option<BasicAuth>,
}

impl UrlMap {
    pub fn new(prefix: impl Into<String>, handler: Handler) -> Self {
        Self {
            prefix: prefix.into(),
            handler,
            flags: RouteFlags::default(),
            auth: None,
        }
    }

    pub fn allow_post(mut self) -> Self {
        self.flags.allow_post = true;
        self
    }

    pub fn remove_leading_slash(mut self) -> Self {
        self.flags.remove_leading_slash = true;
        self
    }

    pub fn parse_accept_encoding(mut self) -> Self {
        self.flags.parse_accept_encoding = true;
        self
    }

    pub fn can_rewrite(mut self) -> Self {
        self.flags.can_rewrite = true;
        self
    }

    /// Gate this route behind basic authorization.
    pub fn with_auth(mut self, auth: BasicAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub(crate) fn handler(&self) -> &Handler {
        &self.handler
    }

    pub(crate) fn auth(&self) -> Option<&BasicAuth> {
        self.auth.as_ref()
    }
}

/// Routing table, ordered longest prefix first.
#[derive(Default)]
pub struct RouteTable {
    maps: Vec<UrlMap>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self { maps: Vec::new() }
    }

    pub fn insert(&mut self, map: UrlMap) {
        self.maps.push(map);
        self.maps.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
    }

    /// Longest registered prefix of `path`, if any.
    pub fn lookup_prefix(&self, path: &[u8]) -> Option<&UrlMap> {
        self.maps
            .iter()
            .find(|map| path.starts_with(map.prefix.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_req: &mut Request) -> HandlerFuture<'_> {
        Box::pin(async { Response::ok() })
    }

    fn table(prefixes: &[&str]) -> RouteTable {
        let mut table = RouteTable::new();
        for prefix in prefixes {
            table.insert(UrlMap::new(*prefix, handler_fn(noop)));
        }
        table
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = table(&["/", "/admin", "/admin/api"]);
        assert_eq!(table.lookup_prefix(b"/").unwrap().prefix(), "/");
        assert_eq!(table.lookup_prefix(b"/other").unwrap().prefix(), "/");
        assert_eq!(table.lookup_prefix(b"/admin").unwrap().prefix(), "/admin");
        assert_eq!(
            table.lookup_prefix(b"/admin/api/v1").unwrap().prefix(),
            "/admin/api"
        );
        assert_eq!(table.lookup_prefix(b"/adminx").unwrap().prefix(), "/admin");
    }

    #[test]
    fn test_no_match() {
        let table = table(&["/app"]);
        assert!(table.lookup_prefix(b"/").is_none());
        assert!(table.lookup_prefix(b"/ap").is_none());
    }

    #[test]
    fn test_route_flags_builder() {
        let map = UrlMap::new("/form", handler_fn(noop))
            .allow_post()
            .remove_leading_slash()
            .parse_accept_encoding()
            .can_rewrite();
        assert!(map.flags.allow_post);
        assert!(map.flags.remove_leading_slash);
        assert!(map.flags.parse_accept_encoding);
        assert!(map.flags.can_rewrite);
    }
}
