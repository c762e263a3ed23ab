/// Route table.
///
/// Routes are collected in a [`RouteTableBuilder`] while the entry script
/// runs, then frozen into an immutable [`RouteTable`] once loading
/// succeeds. A failed load drops the builder, so no partial table is
/// ever reachable.
///
/// Patterns are `/`-separated segments: literals, `:name` parameters and
/// a trailing `*` that captures the rest of the path. The first
/// registered route that matches wins.
use std::fmt;

use thiserror::Error;

/// Opaque handler reference, meaningful only to the engine that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub u32);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("route pattern must start with '/': {0}")]
    Relative(String),
    #[error("'*' must be the last segment: {0}")]
    MisplacedWildcard(String),
    #[error("empty parameter name in {0}")]
    EmptyParam(String),
    #[error("invalid HTTP method '{0}'")]
    Method(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Wildcard,
}

#[derive(Debug, Clone)]
pub struct Route {
    pub method: String,
    pub pattern: String,
    pub handler: HandlerId,
    segments: Vec<Segment>,
}

/// Successful lookup: the handler plus captured parameters in pattern order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub handler: HandlerId,
    pub params: Vec<(String, String)>,
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn parse_pattern(pattern: &str) -> Result<Vec<Segment>, RouteError> {
    if !pattern.starts_with('/') {
        return Err(RouteError::Relative(pattern.to_string()));
    }
    let raw: Vec<&str> = split_path(pattern).collect();
    let mut segments = Vec::with_capacity(raw.len());
    for (i, seg) in raw.iter().enumerate() {
        if *seg == "*" {
            if i + 1 != raw.len() {
                return Err(RouteError::MisplacedWildcard(pattern.to_string()));
            }
            segments.push(Segment::Wildcard);
        } else if let Some(name) = seg.strip_prefix(':') {
            if name.is_empty() {
                return Err(RouteError::EmptyParam(pattern.to_string()));
            }
            segments.push(Segment::Param(name.to_string()));
        } else {
            segments.push(Segment::Literal(seg.to_string()));
        }
    }
    Ok(segments)
}

impl Route {
    fn matches(&self, method: &str, path: &str) -> Option<Vec<(String, String)>> {
        if !self.method.eq_ignore_ascii_case(method) {
            return None;
        }
        let parts: Vec<&str> = split_path(path).collect();
        let mut params = Vec::new();
        for (i, seg) in self.segments.iter().enumerate() {
            match seg {
                Segment::Wildcard => {
                    params.push(("*".to_string(), parts.get(i..)?.join("/")));
                    return Some(params);
                }
                Segment::Literal(lit) => {
                    if parts.get(i) != Some(&lit.as_str()) {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    params.push((name.clone(), parts.get(i)?.to_string()));
                }
            }
        }
        (parts.len() == self.segments.len()).then_some(params)
    }
}

#[derive(Debug, Default)]
pub struct RouteTableBuilder {
    routes: Vec<Route>,
}

impl RouteTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, method: &str, pattern: &str, handler: HandlerId) -> Result<(), RouteError> {
        let valid_method = !method.is_empty() && method.bytes().all(|b| b.is_ascii_alphabetic());
        if !valid_method {
            return Err(RouteError::Method(method.to_string()));
        }
        let segments = parse_pattern(pattern)?;
        self.routes.push(Route {
            method: method.to_ascii_uppercase(),
            pattern: pattern.to_string(),
            handler,
            segments,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn freeze(self) -> RouteTable {
        RouteTable {
            routes: self.routes,
        }
    }
}

/// Immutable, read-only during dispatch.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn lookup(&self, method: &str, path: &str) -> Option<RouteMatch> {
        self.routes.iter().find_map(|route| {
            route.matches(method, path).map(|params| RouteMatch {
                handler: route.handler,
                params,
            })
        })
    }

    pub fn contains_handler(&self, handler: HandlerId) -> bool {
        self.routes.iter().any(|r| r.handler == handler)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
