//! Route table: method + path template -> endpoint
//!
//! Templates use `{name}` for one segment and `{name+}` for the rest of the
//! path. Static segments beat parameters, parameters beat greedy matches,
//! and an explicit method beats `ANY`.

use percent_encoding::percent_decode_str;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::endpoint::Endpoint;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Static(String),
    Param(String),
    Greedy(String),
}

impl Segment {
    fn parse(segment: &str) -> Self {
        match segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            Some(name) => match name.strip_suffix('+') {
                Some(name) => Self::Greedy(name.to_string()),
                None => Self::Param(name.to_string()),
            },
            None => Self::Static(segment.to_string()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Static(_) => 2,
            Self::Param(_) => 1,
            Self::Greedy(_) => 0,
        }
    }
}

#[derive(Debug)]
struct Route {
    /// `None` matches every method
    method: Option<String>,
    segments: Vec<Segment>,
    /// HTTP API `$default` route, matched last
    catch_all: bool,
    /// Full path template, stage included
    template: String,
    staged: bool,
    endpoint: Arc<Endpoint>,
}

/// A matched route
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub endpoint: Arc<Endpoint>,
    pub path_params: BTreeMap<String, String>,
    /// Stage prefix, if the route carries one
    pub stage_prefix: Option<String>,
}

#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

fn split(path: &str) -> Vec<&str> {
    path.split('/').filter(|segment| !segment.is_empty()).collect()
}

fn decode(segment: &str) -> String {
    percent_decode_str(segment).decode_utf8_lossy().into_owned()
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `endpoint`; REST routes get a `/{stage}` prefix unless disabled
    pub fn add(&mut self, endpoint: Arc<Endpoint>, prepend_stage: bool) {
        let method = match endpoint.method.as_str() {
            "ANY" | "*" => None,
            method => Some(method.to_string()),
        };

        if endpoint.path == "$default" {
            self.routes.push(Route {
                method: None,
                segments: Vec::new(),
                catch_all: true,
                template: "/{default*}".to_string(),
                staged: false,
                endpoint,
            });
            return;
        }

        let staged = prepend_stage && !endpoint.http_api;
        let template = if staged {
            format!("/{}{}", endpoint.stage, endpoint.path)
        } else {
            endpoint.path.clone()
        };
        let template = if template.len() > 1 {
            template.trim_end_matches('/').to_string()
        } else {
            template
        };

        self.routes.push(Route {
            method,
            segments: split(&template).into_iter().map(Segment::parse).collect(),
            catch_all: false,
            template,
            staged,
            endpoint,
        });
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Best route for `method` and `path`
    pub fn find(&self, method: &str, path: &str) -> Option<RouteMatch> {
        let parts = split(path);
        let mut best: Option<(Vec<u8>, bool, &Route, BTreeMap<String, String>)> = None;

        for route in &self.routes {
            if route.catch_all {
                continue;
            }
            if let Some(route_method) = &route.method {
                if !route_method.eq_ignore_ascii_case(method) {
                    continue;
                }
            }
            let Some((rank, params)) = match_segments(&route.segments, &parts) else {
                continue;
            };
            let explicit = route.method.is_some();
            let better = match &best {
                None => true,
                Some((best_rank, best_explicit, _, _)) => (&rank, explicit) > (best_rank, *best_explicit),
            };
            if better {
                best = Some((rank, explicit, route, params));
            }
        }

        if let Some((_, _, route, path_params)) = best {
            return Some(Self::matched(route, path_params));
        }

        self.routes
            .iter()
            .find(|route| route.catch_all)
            .map(|route| Self::matched(route, BTreeMap::new()))
    }

    fn matched(route: &Route, path_params: BTreeMap<String, String>) -> RouteMatch {
        let stage_prefix = route.staged.then(|| route.endpoint.stage.clone());
        RouteMatch {
            endpoint: route.endpoint.clone(),
            path_params,
            stage_prefix,
        }
    }

    /// `METHOD - /path` for every route, for the not-found listing
    pub fn describe(&self) -> Vec<String> {
        let mut routes: Vec<String> = self
            .routes
            .iter()
            .map(|route| {
                let method = route.method.as_deref().unwrap_or("ANY");
                format!("{method} - {}", route.template)
            })
            .collect();
        routes.sort();
        routes
    }

    /// Whether any route other than a catch-all answers `method` on `path`
    pub fn has_explicit(&self, method: &str, path: &str) -> bool {
        let parts = split(path);
        self.routes.iter().any(|route| {
            !route.catch_all
                && route.method.as_deref().is_some_and(|m| m.eq_ignore_ascii_case(method))
                && match_segments(&route.segments, &parts).is_some()
        })
    }
}

/// Rank vector (one entry per template segment) plus decoded parameters
fn match_segments(segments: &[Segment], parts: &[&str]) -> Option<(Vec<u8>, BTreeMap<String, String>)> {
    let mut params = BTreeMap::new();
    let mut rank = Vec::with_capacity(segments.len());
    let mut index = 0;

    for (position, segment) in segments.iter().enumerate() {
        rank.push(segment.rank());
        match segment {
            Segment::Static(expected) => {
                let part = parts.get(index)?;
                if decode(part) != *expected && part != expected {
                    return None;
                }
                index += 1;
            }
            Segment::Param(name) => {
                let part = parts.get(index)?;
                params.insert(name.clone(), decode(part));
                index += 1;
            }
            Segment::Greedy(name) => {
                // Greedy only as the last segment, and it needs at least one part
                if position != segments.len() - 1 || index >= parts.len() {
                    return None;
                }
                let rest: Vec<String> = parts[index..].iter().map(|part| decode(part)).collect();
                params.insert(name.clone(), rest.join("/"));
                index = parts.len();
            }
        }
    }

    (index == parts.len()).then_some((rank, params))
}
