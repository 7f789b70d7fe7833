//! A single registered route and its compiled path.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use super::RouteError;
use crate::Method;
use crate::Response;
use crate::context::{Context, Parameters};

/// Type-erased, heap-allocated async handler that processes a [`Context`] and returns a
/// [`Response`].
///
/// Handlers are stored behind `Arc<dyn Fn(…)>` so they can be cloned and shared across
/// tasks without copying the underlying closure. In practice you never construct this
/// type directly; pass any async closure to [`Route::new`].
pub type Handler =
    Arc<dyn Fn(Context) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Context) -> impl Future<Output = Response> + Send` that is also
/// `Send + Sync + 'static` implements this trait automatically via the blanket impl
/// below.
pub trait IntoHandler: Send + Sync + 'static {
    /// Call the handler with the given context, boxing the returned future.
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin((self)(ctx))
    }
}

// One piece of a path template, used to rebuild URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Static(String),
    Parameter(String),
}

/// A path with variable segments, compiled once into an anchored regex.
#[derive(Debug, Clone)]
pub struct DynamicPath {
    regex: Regex,
    template: Vec<Segment>,
    names: Vec<String>,
}

impl DynamicPath {
    /// Returns the compiled matcher.
    pub fn regex(&self) -> &Regex {
        &self.regex
    }

    /// Returns the parameter names in the order they appear in the path.
    pub fn parameter_names(&self) -> &[String] {
        &self.names
    }

    fn captures(&self, path: &str) -> Option<Parameters> {
        let caps = self.regex.captures(path)?;
        let mut params = Parameters::new();
        for name in &self.names {
            if let Some(m) = caps.name(name) {
                params.insert(name.clone(), m.as_str().to_owned());
            }
        }
        Some(params)
    }
}

/// How a route's path is matched, decided once at registration.
#[derive(Debug, Clone)]
pub enum RoutePath {
    /// Exact string equality, e.g. `/users`.
    Literal(String),
    /// Variable segments, e.g. `/users/{id}` or `/files/{name:.+}`.
    Dynamic(DynamicPath),
}

impl RoutePath {
    /// Compiles a path pattern.
    ///
    /// `{name}` matches one non-empty segment; `{name:regex}` supplies a
    /// custom pattern. A path without braces is literal.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::InvalidPattern`] for unbalanced braces, invalid
    /// parameter names, or a custom pattern that does not compile.
    pub fn parse(pattern: &str) -> Result<Self, RouteError> {
        if !pattern.contains('{') && !pattern.contains('}') {
            return Ok(RoutePath::Literal(pattern.to_owned()));
        }

        let invalid = |reason: &str| RouteError::InvalidPattern {
            pattern: pattern.to_owned(),
            reason: reason.to_owned(),
        };

        let mut template = Vec::new();
        let mut names: Vec<String> = Vec::new();
        let mut regex_src = String::from("^");
        let mut literal = String::new();
        let mut chars = pattern.chars();

        while let Some(c) = chars.next() {
            match c {
                '{' => {
                    let mut depth = 1;
                    let mut inner = String::new();
                    for c in chars.by_ref() {
                        match c {
                            '{' => depth += 1,
                            '}' => {
                                depth -= 1;
                                if depth == 0 {
                                    break;
                                }
                            }
                            _ => {}
                        }
                        inner.push(c);
                    }
                    if depth != 0 {
                        return Err(invalid("unclosed `{`"));
                    }

                    let (name, custom) = match inner.split_once(':') {
                        Some((name, custom)) => (name, Some(custom)),
                        None => (inner.as_str(), None),
                    };
                    if !is_identifier(name) {
                        return Err(invalid("parameter names must be identifiers"));
                    }
                    if names.iter().any(|n| n == name) {
                        return Err(invalid("duplicate parameter name"));
                    }

                    if !literal.is_empty() {
                        regex_src.push_str(&regex::escape(&literal));
                        template.push(Segment::Static(std::mem::take(&mut literal)));
                    }
                    regex_src.push_str(&format!("(?P<{name}>{})", custom.unwrap_or("[^/]+")));
                    template.push(Segment::Parameter(name.to_owned()));
                    names.push(name.to_owned());
                }
                '}' => return Err(invalid("unmatched `}`")),
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            regex_src.push_str(&regex::escape(&literal));
            template.push(Segment::Static(literal));
        }
        regex_src.push('$');

        let regex = Regex::new(&regex_src).map_err(|e| invalid(&e.to_string()))?;
        Ok(RoutePath::Dynamic(DynamicPath {
            regex,
            template,
            names,
        }))
    }

    /// Returns `true` for [`RoutePath::Dynamic`].
    pub fn is_dynamic(&self) -> bool {
        matches!(self, RoutePath::Dynamic(_))
    }

    /// Full-string match of `path`, returning captured parameters on success.
    pub fn matches(&self, path: &str) -> Option<Parameters> {
        match self {
            RoutePath::Literal(literal) => (literal == path).then(Parameters::new),
            RoutePath::Dynamic(dynamic) => dynamic.captures(path),
        }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A handler bound to a path, a set of methods, and optional host patterns.
///
/// Routes are immutable once handed to the router.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use apodo::{Method, Response, StatusCode};
/// use apodo::router::Route;
///
/// let route = Route::new("/users/{id}", |_ctx| async { Response::new(StatusCode::Ok) })
///     .unwrap()
///     .methods(["get", "head"])
///     .name("get_user")
///     .timeout(Duration::from_secs(5));
///
/// assert_eq!(route.allowed_methods(), &[Method::Get, Method::Head]);
/// assert!(route.path().is_dynamic());
/// ```
#[derive(Clone)]
pub struct Route {
    pattern: String,
    path: RoutePath,
    handler: Handler,
    methods: Vec<Method>,
    hosts: Vec<String>,
    name: Option<String>,
    timeout: Option<Duration>,
}

impl Route {
    /// Creates a `GET` route.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::InvalidPattern`] if `path` cannot be compiled.
    pub fn new(path: &str, handler: impl IntoHandler) -> Result<Self, RouteError> {
        let handler: Handler = Arc::new(move |ctx| handler.call(ctx));
        Ok(Self {
            pattern: path.to_owned(),
            path: RoutePath::parse(path)?,
            handler,
            methods: vec![Method::Get],
            hosts: Vec::new(),
            name: None,
            timeout: None,
        })
    }

    /// Sets the accepted methods. Names are upper-cased and de-duplicated;
    /// an empty set keeps `GET`.
    #[must_use]
    pub fn methods<I, M>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: AsRef<str>,
    {
        let mut cleaned: Vec<Method> = Vec::new();
        for method in methods {
            let method = Method::from(method.as_ref());
            if !cleaned.contains(&method) {
                cleaned.push(method);
            }
        }
        if !cleaned.is_empty() {
            self.methods = cleaned;
        }
        self
    }

    /// Restricts the route to requests whose `Host` fully matches one of
    /// the given regular expressions.
    ///
    /// The `Host` value is matched as sent, including any `:port`, so a
    /// pattern that should accept one needs an optional port suffix such as
    /// `api\.example\.com(:\d+)?`.
    #[must_use]
    pub fn hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// Names the route for reverse lookup.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Cancels the handler if it runs longer than `timeout`.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Returns the raw pattern the route was declared with.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Returns the compiled path.
    pub fn path(&self) -> &RoutePath {
        &self.path
    }

    pub fn allowed_methods(&self) -> &[Method] {
        &self.methods
    }

    pub fn host_patterns(&self) -> &[String] {
        &self.hosts
    }

    pub fn route_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Returns the type-erased handler.
    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    /// Full-string match of `path`, returning captured parameters on success.
    pub fn matches(&self, path: &str) -> Option<Parameters> {
        self.path.matches(path)
    }

    // Copy of this route with a path prefix prepended and a name prefix
    // `:`-joined to its name.
    pub(crate) fn prefixed(&self, name_prefix: &str, path_prefix: &str) -> Result<Self, RouteError> {
        let mut route = self.clone();
        if !path_prefix.is_empty() {
            route.pattern = format!("{path_prefix}{}", self.pattern);
            route.path = RoutePath::parse(&route.pattern)?;
        }
        if !name_prefix.is_empty() {
            route.name = self.name.as_ref().map(|name| format!("{name_prefix}:{name}"));
        }
        Ok(route)
    }

    /// Builds a URL by substituting `kwargs` by name, then `args` in order,
    /// into the path template. Keyword arguments the path does not use are
    /// appended as a query string.
    ///
    /// # Errors
    ///
    /// [`RouteError::MissingUrlParameter`] if a parameter has no value, and
    /// [`RouteError::TooManyUrlArguments`] if positional arguments are left over.
    pub fn build_url(
        &self,
        args: &[&dyn fmt::Display],
        kwargs: &[(&str, &dyn fmt::Display)],
    ) -> Result<String, RouteError> {
        let route_name = || self.name.clone().unwrap_or_else(|| self.pattern.clone());

        let (mut url, used) = match &self.path {
            RoutePath::Literal(path) => {
                if !args.is_empty() {
                    return Err(RouteError::TooManyUrlArguments {
                        route: route_name(),
                        expected: 0,
                        given: args.len(),
                    });
                }
                (path.clone(), Vec::new())
            }
            RoutePath::Dynamic(dynamic) => {
                let mut url = String::new();
                let mut used = Vec::new();
                let mut positional = args.iter();
                for segment in &dynamic.template {
                    match segment {
                        Segment::Static(s) => url.push_str(s),
                        Segment::Parameter(name) => {
                            if let Some((key, value)) = kwargs.iter().find(|(k, _)| *k == name.as_str()) {
                                url.push_str(&value.to_string());
                                used.push(*key);
                            } else if let Some(value) = positional.next() {
                                url.push_str(&value.to_string());
                            } else {
                                return Err(RouteError::MissingUrlParameter {
                                    route: route_name(),
                                    parameter: name.clone(),
                                });
                            }
                        }
                    }
                }
                let left = positional.len();
                if left > 0 {
                    return Err(RouteError::TooManyUrlArguments {
                        route: route_name(),
                        expected: args.len() - left,
                        given: args.len(),
                    });
                }
                (url, used)
            }
        };

        let mut separator = '?';
        for (key, value) in kwargs.iter().filter(|(k, _)| !used.contains(k)) {
            url.push(separator);
            url.push_str(key);
            url.push('=');
            url.push_str(&value.to_string());
            separator = '&';
        }
        Ok(url)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("pattern", &self.pattern)
            .field("methods", &self.methods)
            .field("hosts", &self.hosts)
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
