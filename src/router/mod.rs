//! Request routing: map methods, hosts and URL paths to handlers.
//!
//! [`Router`] keeps three kinds of tables, filled once at start-up and read
//! concurrently afterwards:
//!
//! | Table                              | Lookup                                  |
//! |------------------------------------|-----------------------------------------|
//! | `method → literal path → route`    | O(1) exact match                        |
//! | `method → [dynamic route]`         | full regex match, registration order    |
//! | `host pattern → method → [route]`  | only when some route declares hosts     |
//!
//! Literal matches always win over dynamic ones for the same method; among
//! dynamic routes the first registered match wins, so declare the more
//! specific patterns first. A miss that would have matched under another
//! method becomes [`RouteError::MethodNotAllowed`].
//!
//! Named routes are also indexed for reverse lookup with
//! [`Router::build_url`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::context::Parameters;
use crate::{Method, Request};

pub mod blueprint;
pub mod route;

pub use blueprint::{Blueprint, BlueprintError, Prefix};
pub use route::{Handler, IntoHandler, Route, RoutePath};

/// Routing and reverse-lookup failures. None of them is fatal for the
/// connection; the caller turns them into 404/405 responses.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("no route matches the request")]
    NotFound,

    #[error("no route named `{0}`; check your route names")]
    ReverseNotFound(String),

    #[error("method not allowed (allowed: {})", join_methods(.allowed))]
    MethodNotAllowed { allowed: Vec<Method> },

    #[error("invalid pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("route `{route}` needs a value for `{parameter}`")]
    MissingUrlParameter { route: String, parameter: String },

    #[error("route `{route}` takes {expected} positional arguments, {given} given")]
    TooManyUrlArguments {
        route: String,
        expected: usize,
        given: usize,
    },
}

fn join_methods(methods: &[Method]) -> String {
    methods
        .iter()
        .map(Method::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// A successful resolution: the route plus the path parameters it captured.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Arc<Route>,
    pub params: Parameters,
}

// Routes restricted to hosts matching one pattern.
struct HostTable {
    pattern: String,
    regex: Regex,
    routes: HashMap<Method, Vec<Arc<Route>>>,
}

impl HostTable {
    fn find(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        let routes = self.routes.get(method)?;
        // Literal routes first, then dynamic routes in registration order.
        routes
            .iter()
            .filter(|r| !r.path().is_dynamic())
            .chain(routes.iter().filter(|r| r.path().is_dynamic()))
            .find_map(|route| {
                route.matches(path).map(|params| RouteMatch {
                    route: Arc::clone(route),
                    params,
                })
            })
    }

    fn allowed(&self, method: &Method, path: &str) -> Vec<Method> {
        let mut allowed: Vec<Method> = self
            .routes
            .iter()
            .filter(|(m, _)| *m != method)
            .filter(|(_, routes)| routes.iter().any(|r| r.matches(path).is_some()))
            .map(|(m, _)| m.clone())
            .collect();
        allowed.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        allowed
    }
}

/// HTTP request router.
///
/// # Examples
///
/// ```rust
/// use apodo::{Router, Response, StatusCode};
/// use apodo::context::Context;
/// use apodo::router::Route;
///
/// let mut router = Router::new();
/// router.get("/ping", |_ctx| async { Response::new(StatusCode::Ok) }).unwrap();
/// router
///     .add_route(
///         Route::new("/users/{id}", |ctx: Context| async move {
///             let id = ctx.params().get("id").unwrap_or("unknown").to_owned();
///             Response::new(StatusCode::Ok).body(id)
///         })
///         .unwrap()
///         .name("get_user"),
///         &[],
///     )
///     .unwrap();
///
/// assert_eq!(router.build_url("get_user", &[&42]).unwrap(), "/users/42");
/// ```
#[derive(Default)]
pub struct Router {
    literal: HashMap<Method, HashMap<String, Arc<Route>>>,
    dynamic: HashMap<Method, Vec<Arc<Route>>>,
    hosts: Vec<HostTable>,
    reverse: HashMap<String, Arc<Route>>,
    blueprints: HashSet<String>,
    len: usize,
}

impl Router {
    /// Create a new, empty `Router` with no registered routes.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use apodo::Router;
    ///
    /// let router = Router::new();
    /// assert!(router.is_empty());
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `GET` requests matching `path`.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::InvalidPattern`] if `path` cannot be compiled.
    pub fn get(&mut self, path: &str, handler: impl IntoHandler) -> Result<&mut Self, RouteError> {
        self.add_route(Route::new(path, handler)?, &[])?;
        Ok(self)
    }

    /// Register a handler for `POST` requests matching `path`.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::InvalidPattern`] if `path` cannot be compiled.
    pub fn post(&mut self, path: &str, handler: impl IntoHandler) -> Result<&mut Self, RouteError> {
        self.add_route(Route::new(path, handler)?.methods(["POST"]), &[])?;
        Ok(self)
    }

    /// Register a handler for `PUT` requests matching `path`.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::InvalidPattern`] if `path` cannot be compiled.
    pub fn put(&mut self, path: &str, handler: impl IntoHandler) -> Result<&mut Self, RouteError> {
        self.add_route(Route::new(path, handler)?.methods(["PUT"]), &[])?;
        Ok(self)
    }

    /// Register a handler for `DELETE` requests matching `path`.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::InvalidPattern`] if `path` cannot be compiled.
    pub fn delete(
        &mut self,
        path: &str,
        handler: impl IntoHandler,
    ) -> Result<&mut Self, RouteError> {
        self.add_route(Route::new(path, handler)?.methods(["DELETE"]), &[])?;
        Ok(self)
    }

    /// Register a handler for `PATCH` requests matching `path`.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::InvalidPattern`] if `path` cannot be compiled.
    pub fn patch(&mut self, path: &str, handler: impl IntoHandler) -> Result<&mut Self, RouteError> {
        self.add_route(Route::new(path, handler)?.methods(["PATCH"]), &[])?;
        Ok(self)
    }

    /// Registers `route` once per prefix.
    ///
    /// Each prefix prepends its path to the route's path and `:`-joins its
    /// name onto the route's name. An empty slice registers the route as is.
    /// The route is added under every method it accepts; routes that declare
    /// hosts go to the host tables only. A later registration of the same
    /// (method, literal path) or name replaces the earlier one.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::InvalidPattern`] if a prefixed path or a host
    /// pattern cannot be compiled.
    pub fn add_route(&mut self, route: Route, prefixes: &[Prefix]) -> Result<(), RouteError> {
        let root = [Prefix::root()];
        let prefixes = if prefixes.is_empty() { &root[..] } else { prefixes };

        for prefix in prefixes {
            let route = Arc::new(route.prefixed(&prefix.name, &prefix.path)?);

            if route.host_patterns().is_empty() {
                self.insert_hostless(&route);
            } else {
                for host in route.host_patterns() {
                    let table = self.host_table(host)?;
                    for method in route.allowed_methods() {
                        table
                            .routes
                            .entry(method.clone())
                            .or_default()
                            .push(Arc::clone(&route));
                    }
                }
            }

            if let Some(name) = route.route_name() {
                if self
                    .reverse
                    .insert(name.to_owned(), Arc::clone(&route))
                    .is_some()
                {
                    warn!(route = name, "route name registered twice; the last one wins");
                }
            }

            debug!(pattern = route.pattern(), methods = ?route.allowed_methods(), "route registered");
            self.len += 1;
        }
        Ok(())
    }

    fn insert_hostless(&mut self, route: &Arc<Route>) {
        for method in route.allowed_methods() {
            match route.path() {
                RoutePath::Literal(path) => {
                    let previous = self
                        .literal
                        .entry(method.clone())
                        .or_default()
                        .insert(path.clone(), Arc::clone(route));
                    if previous.is_some() {
                        warn!(%method, path = %path, "route registered twice; the last one wins");
                    }
                }
                RoutePath::Dynamic(_) => {
                    self.dynamic
                        .entry(method.clone())
                        .or_default()
                        .push(Arc::clone(route));
                }
            }
        }
    }

    fn host_table(&mut self, host: &str) -> Result<&mut HostTable, RouteError> {
        let index = match self.hosts.iter().position(|t| t.pattern == host) {
            Some(index) => index,
            None => {
                let regex = Regex::new(&format!("^(?:{host})$")).map_err(|e| {
                    RouteError::InvalidPattern {
                        pattern: host.to_owned(),
                        reason: e.to_string(),
                    }
                })?;
                self.hosts.push(HostTable {
                    pattern: host.to_owned(),
                    regex,
                    routes: HashMap::new(),
                });
                self.hosts.len() - 1
            }
        };
        Ok(&mut self.hosts[index])
    }

    /// Registers every route of `blueprint` and its nested blueprints.
    ///
    /// # Errors
    ///
    /// [`BlueprintError::DuplicatedBlueprint`] if a blueprint with the same name was
    /// already added, or a wrapped [`RouteError`] from route registration.
    pub fn add_blueprint(
        &mut self,
        blueprint: Blueprint,
        prefixes: &[Prefix],
    ) -> Result<(), BlueprintError> {
        if !self.blueprints.insert(blueprint.name().to_owned()) {
            return Err(BlueprintError::DuplicatedBlueprint(blueprint.name().to_owned()));
        }
        let root = [Prefix::root()];
        let prefixes = if prefixes.is_empty() { &root[..] } else { prefixes };
        self.register_blueprint(&blueprint, prefixes)?;
        Ok(())
    }

    fn register_blueprint(
        &mut self,
        blueprint: &Blueprint,
        prefixes: &[Prefix],
    ) -> Result<(), RouteError> {
        for (child, child_prefixes) in blueprint.children() {
            let merged: Vec<Prefix> = prefixes
                .iter()
                .flat_map(|outer| child_prefixes.iter().map(move |inner| outer.join(inner)))
                .collect();
            self.register_blueprint(child, &merged)?;
        }

        for route in blueprint.routes() {
            let route = if route.host_patterns().is_empty() && !blueprint.host_patterns().is_empty() {
                route.clone().hosts(blueprint.host_patterns().iter().cloned())
            } else {
                route.clone()
            };
            self.add_route(route, prefixes)?;
        }
        Ok(())
    }

    /// Return the number of registrations (one per route and prefix).
    pub fn len(&self) -> usize {
        self.len
    }

    /// Return `true` if no routes have been registered.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the route registered under `name`.
    pub fn route_by_name(&self, name: &str) -> Option<&Arc<Route>> {
        self.reverse.get(name)
    }

    /// Resolves `request` to a route.
    ///
    /// # Errors
    ///
    /// [`RouteError::MethodNotAllowed`] when the path exists under other
    /// methods only, [`RouteError::NotFound`] when nothing matches.
    pub fn get_route(&self, request: &Request) -> Result<RouteMatch, RouteError> {
        self.resolve(request.method(), request.path(), request.host())
    }

    /// Resolves a (method, path, host) triple; see [`get_route`](Self::get_route).
    ///
    /// # Errors
    ///
    /// Same as [`get_route`](Self::get_route).
    pub fn resolve(
        &self,
        method: &Method,
        path: &str,
        host: Option<&str>,
    ) -> Result<RouteMatch, RouteError> {
        if let Some(host) = host {
            for table in self.hosts.iter().filter(|t| t.regex.is_match(host)) {
                if let Some(found) = table.find(method, path) {
                    return Ok(found);
                }
                let allowed = table.allowed(method, path);
                if !allowed.is_empty() {
                    return Err(RouteError::MethodNotAllowed { allowed });
                }
            }
        }
        self.find_route(method, path)
    }

    fn find_route(&self, method: &Method, path: &str) -> Result<RouteMatch, RouteError> {
        if let Some(route) = self.literal.get(method).and_then(|routes| routes.get(path)) {
            return Ok(RouteMatch {
                route: Arc::clone(route),
                params: Parameters::new(),
            });
        }

        if let Some(routes) = self.dynamic.get(method) {
            for route in routes {
                if let Some(params) = route.matches(path) {
                    return Ok(RouteMatch {
                        route: Arc::clone(route),
                        params,
                    });
                }
            }
        }

        let allowed = self.allowed_methods(method, path);
        if allowed.is_empty() {
            Err(RouteError::NotFound)
        } else {
            Err(RouteError::MethodNotAllowed { allowed })
        }
    }

    // Methods other than `method` with a literal or dynamic match for `path`.
    fn allowed_methods(&self, method: &Method, path: &str) -> Vec<Method> {
        let mut allowed: Vec<Method> = Vec::new();
        let literal = self
            .literal
            .iter()
            .filter(|(_, routes)| routes.contains_key(path))
            .map(|(m, _)| m);
        let dynamic = self
            .dynamic
            .iter()
            .filter(|(_, routes)| routes.iter().any(|r| r.matches(path).is_some()))
            .map(|(m, _)| m);
        for candidate in literal.chain(dynamic) {
            if candidate != method && !allowed.contains(candidate) {
                allowed.push(candidate.clone());
            }
        }
        allowed.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        allowed
    }

    /// Builds the URL of the route named `name` from positional arguments.
    ///
    /// # Errors
    ///
    /// [`RouteError::ReverseNotFound`] for an unknown name, plus the
    /// substitution errors of [`Route::build_url`].
    pub fn build_url(&self, name: &str, args: &[&dyn fmt::Display]) -> Result<String, RouteError> {
        self.build_url_with(name, args, &[])
    }

    /// Builds the URL of the route named `name` from keyword arguments.
    ///
    /// # Errors
    ///
    /// Same as [`build_url`](Self::build_url).
    pub fn build_url_named(
        &self,
        name: &str,
        kwargs: &[(&str, &dyn fmt::Display)],
    ) -> Result<String, RouteError> {
        self.build_url_with(name, &[], kwargs)
    }

    /// Builds the URL of the route named `name` from both argument kinds.
    ///
    /// # Errors
    ///
    /// Same as [`build_url`](Self::build_url).
    pub fn build_url_with(
        &self,
        name: &str,
        args: &[&dyn fmt::Display],
        kwargs: &[(&str, &dyn fmt::Display)],
    ) -> Result<String, RouteError> {
        let route = self
            .reverse
            .get(name)
            .ok_or_else(|| RouteError::ReverseNotFound(name.to_owned()))?;
        route.build_url(args, kwargs)
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.len)
            .field("hosts", &self.hosts.iter().map(|t| &t.pattern).collect::<Vec<_>>())
            .field("named", &self.reverse.len())
            .finish()
    }
}
