use std::fmt;

use crate::http::{Method, Request};

/// A request pattern: an optional method and a path glob.
///
/// In the path, `*` matches exactly one segment, except in the last position
/// where it matches one or more. A lone `*` matches every path, `/` included.
///
/// ```
/// # use tern::{Method, Request, Route};
/// let route = Route::new("GET /hello/*");
/// assert!(route.matches(&Request::new(Method::GET, "/hello/world")));
/// assert!(!route.matches(&Request::new(Method::POST, "/hello/world")));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    method: Option<Method>,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard,
    Remainder,
}

impl Route {
    pub fn new(pattern: &str) -> Self {
        let pattern = pattern.trim();
        let (method, path) = match pattern.split_once(' ') {
            Some((method, path)) => match Method::from_bytes(method.as_bytes()) {
                Ok(method) => (Some(method), path.trim()),
                Err(_) => (None, pattern),
            },
            None => (None, pattern),
        };

        let parts: Vec<&str> = components(path).collect();
        let last = parts.len().saturating_sub(1);
        let segments = parts
            .iter()
            .enumerate()
            .map(|(index, part)| match *part {
                "*" if index == last => Segment::Remainder,
                "*" => Segment::Wildcard,
                literal => Segment::Literal(literal.to_string()),
            })
            .collect();

        Route { method, segments }
    }

    pub fn method(&self) -> Option<&Method> {
        self.method.as_ref()
    }

    pub fn matches(&self, request: &Request) -> bool {
        if let Some(method) = &self.method {
            if *method != request.method {
                return false;
            }
        }
        self.matches_path(&request.path)
    }

    pub fn matches_path(&self, path: &str) -> bool {
        let mut parts = components(path);
        for segment in &self.segments {
            match segment {
                Segment::Remainder => return parts.next().is_some() || self.segments.len() == 1,
                Segment::Wildcard => {
                    if parts.next().is_none() {
                        return false;
                    }
                }
                Segment::Literal(literal) => {
                    if parts.next() != Some(literal.as_str()) {
                        return false;
                    }
                }
            }
        }
        parts.next().is_none()
    }
}

fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|part| !part.is_empty())
}

impl From<&str> for Route {
    fn from(pattern: &str) -> Self {
        Route::new(pattern)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(method) = &self.method {
            write!(f, "{} ", method)?;
        }
        if self.segments == [Segment::Remainder] {
            return f.write_str("*");
        }
        for segment in &self.segments {
            match segment {
                Segment::Literal(literal) => write!(f, "/{}", literal)?,
                Segment::Wildcard | Segment::Remainder => f.write_str("/*")?,
            }
        }
        if self.segments.is_empty() {
            f.write_str("/")?;
        }
        Ok(())
    }
}
