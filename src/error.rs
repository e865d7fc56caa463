//! Error type of the admission service.
use crate::limit::LimitError;
use crate::route::RouteError;
use crate::upstream::ProxyResponse;
use std::fmt;

/// Failure of one proxied request.
///
/// A local quota refusal is not an error: it is a normal 430 response.
#[derive(Debug)]
pub enum ProxyError<E> {
    /// The request target could not be resolved.
    Route(RouteError),
    /// The upstream call failed in transport.
    Upstream(E),
    /// The limit engine hit an internal precondition failure.
    Limit(LimitError),
}

impl<E: fmt::Display> fmt::Display for ProxyError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Route(e) => write!(f, "bad request: {}", e),
            Self::Upstream(e) => write!(f, "upstream failure: {}", e),
            Self::Limit(e) => write!(f, "limit engine failure: {}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ProxyError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Route(e) => Some(e),
            Self::Upstream(e) => Some(e),
            Self::Limit(e) => Some(e),
        }
    }
}

impl<E> From<RouteError> for ProxyError<E> {
    fn from(err: RouteError) -> Self {
        Self::Route(err)
    }
}

impl<E> From<LimitError> for ProxyError<E> {
    fn from(err: LimitError) -> Self {
        Self::Limit(err)
    }
}

impl<E> ProxyError<E> {
    /// Client-visible status code.
    pub fn status(&self) -> u16 {
        match self {
            Self::Route(_) => 400,
            Self::Upstream(_) => 502,
            Self::Limit(_) => 500,
        }
    }

    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::Upstream(_))
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Upstream(e) => Some(e),
            _ => None,
        }
    }
}

impl<E: fmt::Display> ProxyError<E> {
    /// Response sent to the client in place of an upstream answer.
    pub fn into_response(self) -> ProxyResponse {
        ProxyResponse::error(self.status(), &self.to_string())
    }
}
