//! Route resolution for inbound requests.
//!
//! The route table is never cached: the manager rebuilds the list of
//! [`RouteEntry`] values from the definitions and the instance registry on
//! every request and hands it to [`RouteResolver::resolve`].

/// One defined route and whether its worker currently has an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry<'a> {
    /// Route without surrounding slashes.
    pub route: &'a str,
    /// Owning worker.
    pub worker_id: &'a str,
    /// Whether the worker has a running instance.
    pub running: bool,
}

/// Outcome of resolving a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteMatch {
    /// Dispatch to a running worker with the rewritten path.
    Dispatch {
        /// Target worker.
        worker_id: String,
        /// Matched route.
        route: String,
        /// Remainder of the path after the route; always starts with `/`.
        forwarded_path: String,
    },
    /// A defined worker matches but has no running instance.
    NotRunning {
        /// Matched route.
        route: String,
    },
    /// The path is related to a defined route (one is a string prefix of the
    /// other) but matches none on a segment boundary.
    Unknown,
    /// The path has nothing to do with workers.
    NotAWorkerRoute,
}

/// Resolves request paths against the current route table.
#[derive(Debug, Clone, Default)]
pub struct RouteResolver {
    reserved_prefixes: Vec<String>,
}

impl RouteResolver {
    /// Create a resolver that never claims paths under `reserved_prefixes`.
    pub fn new<I, S>(reserved_prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            reserved_prefixes: reserved_prefixes
                .into_iter()
                .map(|p| p.as_ref().trim_matches('/').to_string())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Whether `path` (leading slash already stripped) is reserved.
    pub fn is_reserved(&self, path: &str) -> bool {
        self.reserved_prefixes
            .iter()
            .any(|prefix| segment_match(path, prefix))
    }

    /// Resolve `path` (with or without its leading slash, no query string).
    pub fn resolve(&self, path: &str, routes: &[RouteEntry<'_>]) -> RouteMatch {
        let path = path.strip_prefix('/').unwrap_or(path);
        if path.is_empty() || self.is_reserved(path) {
            return RouteMatch::NotAWorkerRoute;
        }

        let routes = routes.iter().filter(|entry| !entry.route.is_empty());

        // Exact match first, then the longest segment prefix.
        let best_running = routes
            .clone()
            .filter(|entry| entry.running)
            .find(|entry| entry.route == path)
            .or_else(|| {
                routes
                    .clone()
                    .filter(|entry| entry.running && segment_match(path, entry.route))
                    .max_by_key(|entry| entry.route.len())
            });

        if let Some(entry) = best_running {
            let remainder = &path[entry.route.len()..];
            let forwarded_path = if remainder.is_empty() {
                "/".to_string()
            } else {
                remainder.to_string()
            };
            return RouteMatch::Dispatch {
                worker_id: entry.worker_id.to_string(),
                route: entry.route.to_string(),
                forwarded_path,
            };
        }

        if let Some(entry) = routes
            .clone()
            .filter(|entry| segment_match(path, entry.route))
            .max_by_key(|entry| entry.route.len())
        {
            return RouteMatch::NotRunning {
                route: entry.route.to_string(),
            };
        }

        if routes
            .clone()
            .any(|entry| path.starts_with(entry.route) || entry.route.starts_with(path))
        {
            return RouteMatch::Unknown;
        }

        RouteMatch::NotAWorkerRoute
    }
}

/// `path` equals `route` or continues it with a `/`.
fn segment_match(path: &str, route: &str) -> bool {
    path.strip_prefix(route)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}
