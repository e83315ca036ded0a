use std::fmt;

use crate::{AppError, AppResult};

/// A dotted route identifier: `serverType.service.method`, or
/// `service.method` for a route handled locally (any server type).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub server_type: Option<String>,
    pub service: String,
    pub method: String,
}

impl Route {
    /// Parses a route literal. Pure parsing, no side effects.
    pub fn parse(raw: &str) -> AppResult<Route> {
        let segments: Vec<&str> = raw.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(AppError::InvalidRoute(format!(
                "empty segment in '{}'",
                raw
            )));
        }
        match segments.as_slice() {
            [service, method] => Ok(Route {
                server_type: None,
                service: (*service).to_string(),
                method: (*method).to_string(),
            }),
            [server_type, service, method] => Ok(Route {
                server_type: Some((*server_type).to_string()),
                service: (*service).to_string(),
                method: (*method).to_string(),
            }),
            _ => Err(AppError::InvalidRoute(format!(
                "'{}' has {} segments, expected 2 or 3",
                raw,
                segments.len()
            ))),
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.server_type {
            Some(server_type) => {
                write!(f, "{}.{}.{}", server_type, self.service, self.method)
            }
            None => write!(f, "{}.{}", self.service, self.method),
        }
    }
}
