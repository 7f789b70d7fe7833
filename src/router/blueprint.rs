//! Named groups of routes that can be mounted under one or more prefixes.

use thiserror::Error;

use super::{Route, RouteError};

/// Errors raised while assembling blueprints at start-up.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BlueprintError {
    #[error("blueprint `{0}` was added twice; use more prefixes or a different hierarchy")]
    DuplicatedBlueprint(String),

    #[error("prefix `{prefix}` conflicts with an existing prefix")]
    ConflictingPrefixes { prefix: String },

    #[error(transparent)]
    Route(#[from] RouteError),
}

/// A `(name prefix, path prefix)` pair applied when mounting routes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Prefix {
    pub name: String,
    pub path: String,
}

impl Prefix {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// The empty prefix: names and paths are left as declared.
    pub fn root() -> Self {
        Self::default()
    }

    /// Nests `inner` under `self`.
    pub fn join(&self, inner: &Prefix) -> Prefix {
        let name = match (self.name.is_empty(), inner.name.is_empty()) {
            (true, _) => inner.name.clone(),
            (false, true) => self.name.clone(),
            (false, false) => format!("{}:{}", self.name, inner.name),
        };
        Prefix {
            name,
            path: format!("{}{}", self.path, inner.path),
        }
    }
}

/// A named collection of routes and nested blueprints.
///
/// Blueprint hosts apply to every route that does not declare its own.
///
/// # Examples
///
/// ```rust
/// use apodo::{Method, Response, Router, StatusCode};
/// use apodo::router::{Blueprint, Prefix, Route};
///
/// let mut users = Blueprint::new("users");
/// users.add_route(
///     Route::new("/{id}", |_ctx| async { Response::new(StatusCode::Ok) })
///         .unwrap()
///         .name("show"),
/// );
///
/// let mut router = Router::new();
/// router
///     .add_blueprint(users, &[Prefix::new("users", "/users")])
///     .unwrap();
///
/// assert_eq!(router.build_url("users:show", &[&7]).unwrap(), "/users/7");
/// assert!(router.resolve(&Method::Get, "/users/7", None).is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct Blueprint {
    name: String,
    routes: Vec<Route>,
    hosts: Vec<String>,
    children: Vec<(Blueprint, Vec<Prefix>)>,
}

impl Blueprint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routes: Vec::new(),
            hosts: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Default host patterns for routes without their own.
    #[must_use]
    pub fn hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    pub fn add_route(&mut self, route: Route) -> &mut Self {
        self.routes.push(route);
        self
    }

    /// Nests `child` under each of `prefixes` (the root prefix when empty).
    ///
    /// # Errors
    ///
    /// [`BlueprintError::DuplicatedBlueprint`] if a child with the same name
    /// is already nested here, [`BlueprintError::ConflictingPrefixes`] if a
    /// non-empty prefix name is already used by a sibling.
    pub fn add_blueprint(
        &mut self,
        child: Blueprint,
        prefixes: Vec<Prefix>,
    ) -> Result<&mut Self, BlueprintError> {
        if self.children.iter().any(|(c, _)| c.name == child.name) {
            return Err(BlueprintError::DuplicatedBlueprint(child.name));
        }

        let prefixes = if prefixes.is_empty() {
            vec![Prefix::root()]
        } else {
            prefixes
        };
        for prefix in prefixes.iter().filter(|p| !p.name.is_empty()) {
            let taken = self
                .children
                .iter()
                .flat_map(|(_, existing)| existing.iter())
                .any(|existing| existing.name == prefix.name);
            if taken {
                return Err(BlueprintError::ConflictingPrefixes {
                    prefix: prefix.name.clone(),
                });
            }
        }

        self.children.push((child, prefixes));
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn host_patterns(&self) -> &[String] {
        &self.hosts
    }

    pub fn children(&self) -> &[(Blueprint, Vec<Prefix>)] {
        &self.children
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Method, Response, Router, StatusCode};

    fn route(path: &str, name: &str) -> Route {
        Route::new(path, |_ctx| async { Response::new(StatusCode::Ok) })
            .unwrap()
            .name(name)
    }

    #[test]
    fn prefix_join() {
        let outer = Prefix::new("api", "/api");
        assert_eq!(outer.join(&Prefix::new("v1", "/v1")), Prefix::new("api:v1", "/api/v1"));
        assert_eq!(outer.join(&Prefix::root()), outer);
        assert_eq!(Prefix::root().join(&outer), outer);
    }

    #[test]
    fn nested_blueprints_merge_prefixes() {
        let mut posts = Blueprint::new("posts");
        posts.add_route(route("/{id}", "show"));

        let mut api = Blueprint::new("api");
        api.add_route(route("/status", "status"));
        api.add_blueprint(posts, vec![Prefix::new("posts", "/posts")]).unwrap();

        let mut router = Router::new();
        router.add_blueprint(api, &[Prefix::new("v1", "/v1")]).unwrap();

        assert_eq!(router.build_url("v1:status", &[]).unwrap(), "/v1/status");
        assert_eq!(router.build_url("v1:posts:show", &[&3]).unwrap(), "/v1/posts/3");
        assert!(router.resolve(&Method::Get, "/v1/posts/3", None).is_ok());
    }

    #[test]
    fn duplicated_child() {
        let mut parent = Blueprint::new("parent");
        parent.add_blueprint(Blueprint::new("child"), vec![]).unwrap();
        assert_eq!(
            parent.add_blueprint(Blueprint::new("child"), vec![]).unwrap_err(),
            BlueprintError::DuplicatedBlueprint("child".into())
        );
    }

    #[test]
    fn conflicting_prefixes() {
        let mut parent = Blueprint::new("parent");
        parent
            .add_blueprint(Blueprint::new("a"), vec![Prefix::new("shared", "/a")])
            .unwrap();
        assert_eq!(
            parent
                .add_blueprint(Blueprint::new("b"), vec![Prefix::new("shared", "/b")])
                .unwrap_err(),
            BlueprintError::ConflictingPrefixes {
                prefix: "shared".into()
            }
        );
        // Unnamed prefixes never conflict.
        parent.add_blueprint(Blueprint::new("c"), vec![]).unwrap();
        parent.add_blueprint(Blueprint::new("d"), vec![]).unwrap();
    }

    #[test]
    fn router_rejects_same_blueprint_twice() {
        let mut router = Router::new();
        router.add_blueprint(Blueprint::new("site"), &[]).unwrap();
        assert_eq!(
            router.add_blueprint(Blueprint::new("site"), &[]).unwrap_err(),
            BlueprintError::DuplicatedBlueprint("site".into())
        );
    }

    #[test]
    fn blueprint_hosts_apply_to_plain_routes() {
        let mut admin = Blueprint::new("admin").hosts(["admin.local"]);
        admin.add_route(route("/", "home"));
        admin.add_route(route("/", "any").hosts([".*"]).methods(["POST"]));

        let mut router = Router::new();
        router.add_blueprint(admin, &[]).unwrap();

        assert!(router.resolve(&Method::Get, "/", Some("admin.local")).is_ok());
        assert_eq!(
            router.resolve(&Method::Get, "/", Some("www.local")).unwrap_err(),
            crate::router::RouteError::MethodNotAllowed {
                allowed: vec![Method::Post]
            }
        );
    }
}
