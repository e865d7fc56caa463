//! Request target resolution: region, method scope and upstream URL.

use crate::limit::ScopeKey;

/// Regions served by the upstream.
pub const DEFAULT_REGIONS: [&str; 22] = [
    "americas", "asia", "ap", "br", "br1", "esports", "eu", "eun1", "europe", "euw1", "jp1", "kr",
    "la1", "la2", "latam", "na", "na1", "oc1", "pbe1", "ru", "sea", "tr1",
];

/// Route prefixes (`{api}/v{N}/{resource}` under `lol/`) tracked with their
/// own method-scope quota.
pub const METHOD_TEMPLATES: [&str; 14] = [
    "summoner/v4/summoners",
    "match/v4/matches",
    "match/v4/matchlists",
    "match/v4/timelines",
    "match/v5/matches",
    "league/v4/entries",
    "league/v4/challengerleagues",
    "league/v4/grandmasterleagues",
    "league/v4/masterleagues",
    "league/v4/leagues",
    "league-exp/v4/entries",
    "spectator/v4/active-games",
    "spectator/v4/featured-games",
    "champion-mastery/v4/champion-masteries",
];

/// Host suffix expected on absolute-form targets.
pub const UPSTREAM_HOST_SUFFIX: &str = ".api.riotgames.com";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("request target {0:?} does not match the upstream path grammar")]
    InvalidTarget(String),
    #[error("unknown region {0:?}")]
    UnknownRegion(String),
}

/// A request target decomposed into region and upstream path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    region: String,
    method: Option<String>,
    path_and_query: String,
}

impl Route {
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Normalized method key, when the path matches a tracked template.
    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    /// Path (with leading `/`) plus query, as sent upstream.
    pub fn path_and_query(&self) -> &str {
        &self.path_and_query
    }

    pub fn app_scope(&self) -> ScopeKey {
        ScopeKey::app(&self.region)
    }

    pub fn method_scope(&self) -> Option<ScopeKey> {
        self.method.as_ref().map(|method| ScopeKey::method(&self.region, method))
    }

    /// Upstream URL from a base template with one `{}` (or `%s`) region
    /// placeholder.
    pub fn upstream_url(&self, api_url: &str) -> String {
        let placeholder = region_placeholder(api_url).unwrap_or("{}");
        let base = api_url.replacen(placeholder, &self.region, 1);
        format!("{}{}", base.trim_end_matches('/'), self.path_and_query)
    }
}

/// Region placeholder used by an upstream URL template, if any.
pub fn region_placeholder(api_url: &str) -> Option<&'static str> {
    ["{}", "%s"].into_iter().find(|p| api_url.contains(p))
}

/// Resolves request targets against the set of allowed regions.
#[derive(Debug, Clone)]
pub struct RouteResolver {
    allowed_regions: Vec<String>,
}

impl Default for RouteResolver {
    fn default() -> Self {
        Self::new(DEFAULT_REGIONS.iter().map(|r| r.to_string()))
    }
}

impl RouteResolver {
    pub fn new(allowed_regions: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed_regions: allowed_regions.into_iter().map(|r| r.to_ascii_lowercase()).collect(),
        }
    }

    pub fn allowed_regions(&self) -> &[String] {
        &self.allowed_regions
    }

    /// Accepts `http(s)://{region}.api.riotgames.com/{path}` and
    /// `/{region}/{path}`.
    pub fn resolve(&self, target: &str) -> Result<Route, RouteError> {
        let invalid = || RouteError::InvalidTarget(target.to_string());

        let (region, rest) = if let Some(without_scheme) =
            target.strip_prefix("https://").or_else(|| target.strip_prefix("http://"))
        {
            let (authority, rest) = match without_scheme.find(['/', '?']) {
                Some(idx) => without_scheme.split_at(idx),
                None => (without_scheme, ""),
            };
            let host = authority.rsplit_once(':').map_or(authority, |(host, _port)| host);
            let region = host
                .to_ascii_lowercase()
                .strip_suffix(UPSTREAM_HOST_SUFFIX)
                .map(str::to_string)
                .ok_or_else(invalid)?;
            (region, rest.to_string())
        } else if let Some(origin) = target.strip_prefix('/') {
            let (region, rest) = match origin.find(['/', '?']) {
                Some(idx) => origin.split_at(idx),
                None => (origin, ""),
            };
            (region.to_ascii_lowercase(), rest.to_string())
        } else {
            return Err(invalid());
        };

        if region.is_empty() || region.contains('.') {
            return Err(invalid());
        }
        if !self.allowed_regions.iter().any(|r| *r == region) {
            return Err(RouteError::UnknownRegion(region));
        }

        let path_and_query = if rest.starts_with('/') { rest } else { format!("/{rest}") };
        let path = path_and_query.split('?').next().unwrap_or_default();
        let method = method_key(path);
        Ok(Route { region, method, path_and_query })
    }
}

fn method_key(path: &str) -> Option<String> {
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    if segments.next()? != "lol" {
        return None;
    }
    let key = [segments.next()?, segments.next()?, segments.next()?].join("/");
    METHOD_TEMPLATES.contains(&key.as_str()).then_some(key)
}
