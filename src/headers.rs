//! Typed view of the handful of HTTP headers the proxy reads or writes.
//!
//! Anything outside [`ProxyHeader`] is dropped at both edges.

use crate::limit::ScopeKind;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// Headers the proxy understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProxyHeader {
    Date,
    ContentType,
    AppRateLimit,
    AppRateLimitCount,
    MethodRateLimit,
    MethodRateLimitCount,
    RetryAfter,
    /// Which quota the upstream enforced on a 429.
    RateLimitType,
    /// Upstream API key, injected on the way out.
    ApiToken,
}

impl ProxyHeader {
    pub const ALL: [ProxyHeader; 9] = [
        ProxyHeader::Date,
        ProxyHeader::ContentType,
        ProxyHeader::AppRateLimit,
        ProxyHeader::AppRateLimitCount,
        ProxyHeader::MethodRateLimit,
        ProxyHeader::MethodRateLimitCount,
        ProxyHeader::RetryAfter,
        ProxyHeader::RateLimitType,
        ProxyHeader::ApiToken,
    ];

    /// Canonical wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyHeader::Date => "Date",
            ProxyHeader::ContentType => "Content-Type",
            ProxyHeader::AppRateLimit => "X-App-Rate-Limit",
            ProxyHeader::AppRateLimitCount => "X-App-Rate-Limit-Count",
            ProxyHeader::MethodRateLimit => "X-Method-Rate-Limit",
            ProxyHeader::MethodRateLimitCount => "X-Method-Rate-Limit-Count",
            ProxyHeader::RetryAfter => "Retry-After",
            ProxyHeader::RateLimitType => "X-Rate-Limit-Type",
            ProxyHeader::ApiToken => "X-Riot-Token",
        }
    }

    /// Case-insensitive lookup by wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|h| h.as_str().eq_ignore_ascii_case(name))
    }

    /// Header declaring the `limit:span` pairs for a scope.
    pub fn limit_for(kind: ScopeKind) -> Self {
        match kind {
            ScopeKind::App => ProxyHeader::AppRateLimit,
            ScopeKind::Method => ProxyHeader::MethodRateLimit,
        }
    }

    /// Header echoing the `count:span` pairs for a scope.
    pub fn count_for(kind: ScopeKind) -> Self {
        match kind {
            ScopeKind::App => ProxyHeader::AppRateLimitCount,
            ScopeKind::Method => ProxyHeader::MethodRateLimitCount,
        }
    }
}

impl fmt::Display for ProxyHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Malformed or missing rate-limit information in an upstream response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("missing {0} header")]
    Missing(ProxyHeader),
    #[error("malformed {header} header: {value:?}")]
    Malformed { header: ProxyHeader, value: String },
    #[error("{header} reports span {span}s with no declared limit")]
    UnknownSpan { header: ProxyHeader, span: u32 },
}

/// Ordered set of [`ProxyHeader`] values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSet {
    values: BTreeMap<ProxyHeader, String>,
}

impl HeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, header: ProxyHeader, value: impl Into<String>) {
        self.values.insert(header, value.into());
    }

    /// Insert by wire name; returns false when the header is not one we keep.
    pub fn insert_raw(&mut self, name: &str, value: impl Into<String>) -> bool {
        match ProxyHeader::from_name(name) {
            Some(header) => {
                self.insert(header, value);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, header: ProxyHeader) -> Option<&str> {
        self.values.get(&header).map(String::as_str)
    }

    pub fn remove(&mut self, header: ProxyHeader) -> Option<String> {
        self.values.remove(&header)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ProxyHeader, &str)> {
        self.values.iter().map(|(h, v)| (*h, v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn require(&self, header: ProxyHeader) -> Result<&str, HeaderError> {
        self.get(header).ok_or(HeaderError::Missing(header))
    }

    /// Upstream `Date` (RFC 1123, GMT) as UTC.
    pub fn date(&self) -> Result<DateTime<Utc>, HeaderError> {
        let value = self.require(ProxyHeader::Date)?;
        DateTime::parse_from_rfc2822(value.trim())
            .map(|at| at.with_timezone(&Utc))
            .map_err(|_| HeaderError::Malformed {
                header: ProxyHeader::Date,
                value: value.to_string(),
            })
    }

    /// Moment the response is known to have been produced by.
    ///
    /// `Date` has one-second resolution, so the end of the stated second is
    /// used.
    pub fn received_at(&self) -> Result<DateTime<Utc>, HeaderError> {
        Ok(self.date()? + TimeDelta::seconds(1))
    }

    /// Limits and counts the upstream reported for one scope kind.
    pub fn scope_report(&self, kind: ScopeKind) -> Result<ScopeReport, HeaderError> {
        let limit_header = ProxyHeader::limit_for(kind);
        let count_header = ProxyHeader::count_for(kind);
        let limits = RateLimitPairs::parse(limit_header, self.require(limit_header)?)?;
        let counts = RateLimitPairs::parse(count_header, self.require(count_header)?)?;
        ScopeReport::join(&limits, &counts, count_header)
    }
}

impl FromIterator<(ProxyHeader, String)> for HeaderSet {
    fn from_iter<I: IntoIterator<Item = (ProxyHeader, String)>>(iter: I) -> Self {
        Self { values: iter.into_iter().collect() }
    }
}

/// Parsed `value:span,value:span,...` list, as `(span, value)` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitPairs(Vec<(u32, u32)>);

impl RateLimitPairs {
    pub fn parse(header: ProxyHeader, value: &str) -> Result<Self, HeaderError> {
        let malformed = || HeaderError::Malformed { header, value: value.to_string() };
        let mut pairs = Vec::new();
        for item in value.split(',') {
            let (amount, span) = item.trim().split_once(':').ok_or_else(malformed)?;
            let amount: u32 = amount.trim().parse().map_err(|_| malformed())?;
            let span: u32 = span.trim().parse().map_err(|_| malformed())?;
            if span == 0 {
                return Err(malformed());
            }
            pairs.push((span, amount));
        }
        Ok(Self(pairs))
    }

    pub fn pairs(&self) -> &[(u32, u32)] {
        &self.0
    }

    pub fn value_for(&self, span: u32) -> Option<u32> {
        self.0.iter().find(|(s, _)| *s == span).map(|(_, v)| *v)
    }
}

/// One window span as reported by a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanReport {
    pub span: u32,
    pub limit: u32,
    pub count: u32,
}

/// Declared limits joined with the echoed counts for one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeReport {
    spans: Vec<SpanReport>,
}

impl ScopeReport {
    /// Join limits and counts by span. Every count needs a declared limit and
    /// every limit a count.
    pub fn join(
        limits: &RateLimitPairs,
        counts: &RateLimitPairs,
        count_header: ProxyHeader,
    ) -> Result<Self, HeaderError> {
        if let Some(&(span, _)) = counts.pairs().iter().find(|(span, _)| limits.value_for(*span).is_none()) {
            return Err(HeaderError::UnknownSpan { header: count_header, span });
        }
        let spans = limits
            .pairs()
            .iter()
            .map(|&(span, limit)| {
                counts.value_for(span).map(|count| SpanReport { span, limit, count }).ok_or_else(|| {
                    HeaderError::Malformed {
                        header: count_header,
                        value: format!("no count for {span}s window"),
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { spans })
    }

    pub fn spans(&self) -> &[SpanReport] {
        &self.spans
    }

    /// `(span, limit)` pairs, as the registry takes them.
    pub fn declared(&self) -> Vec<(u32, u32)> {
        self.spans.iter().map(|s| (s.span, s.limit)).collect()
    }
}
