//! Cache key definitions.
//!
//! Keys are built from a [`Scope`], a [`Domain`] and an ordered list of
//! qualifiers. Every cached view of a domain shares the domain component, so
//! a [`KeyPattern`] over the domain reaches all of them without relying on
//! hand-written string prefixes.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

const SEPARATOR: char = ':';
const OFFSET_PREFIX: &str = "offset=";
const LIMIT_PREFIX: &str = "limit=";

/// Logical resource category with its own live-update channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    /// Vehicle listings for sale.
    Listings,
    /// Meetups, shows and drives.
    Events,
    /// Attendance replies attached to an event.
    Rsvps,
    /// Forum threads and replies.
    ForumPosts,
    /// Per-user saved listings.
    Favorites,
    /// Direct messages between users.
    Messages,
    /// Public user profiles and avatars.
    Profiles,
}

impl Domain {
    pub const ALL: [Domain; 7] = [
        Domain::Listings,
        Domain::Events,
        Domain::Rsvps,
        Domain::ForumPosts,
        Domain::Favorites,
        Domain::Messages,
        Domain::Profiles,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Domain::Listings => "listings",
            Domain::Events => "events",
            Domain::Rsvps => "rsvps",
            Domain::ForumPosts => "forum_posts",
            Domain::Favorites => "favorites",
            Domain::Messages => "messages",
            Domain::Profiles => "profiles",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Domain::ALL
            .into_iter()
            .find(|domain| domain.as_str() == s)
            .ok_or_else(|| KeyParseError::UnknownDomain(s.to_string()))
    }
}

/// The screen-level view a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Home feed sections.
    Home,
    /// Explore/search lists.
    Explore,
    /// Single-entity detail views.
    Detail,
    /// Lists owned by the signed-in user.
    Owned,
    /// Secondary aggregates such as counts.
    Counts,
}

impl Scope {
    pub const ALL: [Scope; 5] = [
        Scope::Home,
        Scope::Explore,
        Scope::Detail,
        Scope::Owned,
        Scope::Counts,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Home => "home",
            Scope::Explore => "explore",
            Scope::Detail => "detail",
            Scope::Owned => "owned",
            Scope::Counts => "counts",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scope::ALL
            .into_iter()
            .find(|scope| scope.as_str() == s)
            .ok_or_else(|| KeyParseError::UnknownScope(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyParseError {
    #[error("cache key must have at least a scope and a domain: `{0}`")]
    Incomplete(String),
    #[error("unknown cache scope `{0}`")]
    UnknownScope(String),
    #[error("unknown cache domain `{0}`")]
    UnknownDomain(String),
    #[error("invalid qualifier `{0}`: qualifiers must be non-empty and contain no `:`")]
    InvalidQualifier(String),
}

/// Address of a cached value.
///
/// Renders as `scope:domain:qualifier…`, e.g. `home:events:upcoming:5`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    scope: Scope,
    domain: Domain,
    qualifiers: Vec<String>,
}

impl CacheKey {
    pub fn new(scope: Scope, domain: Domain) -> Self {
        Self {
            scope,
            domain,
            qualifiers: Vec::new(),
        }
    }

    /// Append a qualifier (filter, id list, page size...).
    pub fn with(mut self, qualifier: impl fmt::Display) -> Result<Self, KeyParseError> {
        let qualifier = qualifier.to_string();
        validate_qualifier(&qualifier)?;
        self.qualifiers.push(qualifier);
        Ok(self)
    }

    pub fn home(domain: Domain) -> Self {
        Self::new(Scope::Home, domain)
    }

    pub fn explore(domain: Domain) -> Self {
        Self::new(Scope::Explore, domain)
    }

    pub fn owned(domain: Domain) -> Self {
        Self::new(Scope::Owned, domain)
    }

    pub fn counts(domain: Domain) -> Self {
        Self::new(Scope::Counts, domain)
    }

    /// Detail view of a single entity.
    pub fn detail(domain: Domain, id: impl fmt::Display) -> Result<Self, KeyParseError> {
        Self::new(Scope::Detail, domain).with(id)
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn qualifiers(&self) -> &[String] {
        &self.qualifiers
    }

    /// Key of one page of the paginated list rooted at this key.
    pub fn page(&self, offset: usize, limit: usize) -> Result<Self, KeyParseError> {
        self.clone()
            .with(format_args!("{OFFSET_PREFIX}{offset}"))?
            .with(format_args!("{LIMIT_PREFIX}{limit}"))
    }

    /// Whether this key is a page of the list rooted at `base`.
    fn is_page_of(&self, base: &CacheKey) -> bool {
        let Some([offset, limit]) = self.qualifiers.strip_prefix(base.qualifiers.as_slice()) else {
            return false;
        };
        self.scope == base.scope
            && self.domain == base.domain
            && offset.starts_with(OFFSET_PREFIX)
            && limit.starts_with(LIMIT_PREFIX)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{}", self.scope, self.domain)?;
        for qualifier in &self.qualifiers {
            write!(f, "{SEPARATOR}{qualifier}")?;
        }
        Ok(())
    }
}

impl FromStr for CacheKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(SEPARATOR);
        let (Some(scope), Some(domain)) = (parts.next(), parts.next()) else {
            return Err(KeyParseError::Incomplete(s.to_string()));
        };

        let mut key = CacheKey::new(scope.parse()?, domain.parse()?);
        for qualifier in parts {
            key = key.with(qualifier)?;
        }
        Ok(key)
    }
}

fn validate_qualifier(qualifier: &str) -> Result<(), KeyParseError> {
    if qualifier.is_empty() || qualifier.contains(SEPARATOR) {
        return Err(KeyParseError::InvalidQualifier(qualifier.to_string()));
    }
    Ok(())
}

/// Selects a group of keys for invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPattern {
    /// Structural match; `None` components match anything.
    Structured {
        scope: Option<Scope>,
        domain: Option<Domain>,
        qualifier_prefix: Vec<String>,
    },
    /// Prefix match over the rendered key.
    Prefix(String),
}

impl KeyPattern {
    /// Every key of a domain, across all scopes.
    pub fn domain(domain: Domain) -> Self {
        Self::Structured {
            scope: None,
            domain: Some(domain),
            qualifier_prefix: Vec::new(),
        }
    }

    /// Every key of a scope, across all domains.
    pub fn scope(scope: Scope) -> Self {
        Self::Structured {
            scope: Some(scope),
            domain: None,
            qualifier_prefix: Vec::new(),
        }
    }

    /// One domain within one scope, e.g. `home:events`.
    pub fn view(scope: Scope, domain: Domain) -> Self {
        Self::Structured {
            scope: Some(scope),
            domain: Some(domain),
            qualifier_prefix: Vec::new(),
        }
    }

    /// Every key addressing `id` in a domain's detail scope, including sub-views
    /// such as `detail:events:<id>:attendees`.
    pub fn entity(domain: Domain, id: impl fmt::Display) -> Self {
        Self::Structured {
            scope: Some(Scope::Detail),
            domain: Some(domain),
            qualifier_prefix: vec![id.to_string()],
        }
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    /// Narrow a structured pattern by one more leading qualifier.
    ///
    /// Prefix patterns are extended textually.
    pub fn and_qualifier(self, qualifier: impl fmt::Display) -> Self {
        match self {
            Self::Structured {
                scope,
                domain,
                mut qualifier_prefix,
            } => {
                qualifier_prefix.push(qualifier.to_string());
                Self::Structured {
                    scope,
                    domain,
                    qualifier_prefix,
                }
            }
            Self::Prefix(mut prefix) => {
                prefix.push(SEPARATOR);
                prefix.push_str(&qualifier.to_string());
                Self::Prefix(prefix)
            }
        }
    }

    pub fn matches(&self, key: &CacheKey) -> bool {
        match self {
            Self::Structured {
                scope,
                domain,
                qualifier_prefix,
            } => {
                scope.is_none_or(|scope| scope == key.scope)
                    && domain.is_none_or(|domain| domain == key.domain)
                    && key.qualifiers.starts_with(qualifier_prefix)
            }
            Self::Prefix(prefix) => key.to_string().starts_with(prefix.as_str()),
        }
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Structured {
                scope,
                domain,
                qualifier_prefix,
            } => {
                let scope = scope.map(Scope::as_str).unwrap_or("*");
                let domain = domain.map(Domain::as_str).unwrap_or("*");
                write!(f, "{scope}{SEPARATOR}{domain}")?;
                for qualifier in qualifier_prefix {
                    write!(f, "{SEPARATOR}{qualifier}")?;
                }
                f.write_str("*")
            }
            Self::Prefix(prefix) => write!(f, "{prefix}*"),
        }
    }
}

/// Target of an invalidation: one key, every key matching a pattern, or
/// every page of one paginated list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Invalidation {
    Exact(CacheKey),
    Pattern(KeyPattern),
    /// Pages built by [`CacheKey::page`] on this base key, at any page size.
    /// Keys that merely share the base as a prefix are not pages.
    Pages(CacheKey),
}

impl Invalidation {
    pub fn matches(&self, key: &CacheKey) -> bool {
        match self {
            Self::Exact(exact) => exact == key,
            Self::Pattern(pattern) => pattern.matches(key),
            Self::Pages(base) => key.is_page_of(base),
        }
    }
}

impl fmt::Display for Invalidation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(key) => write!(f, "{key}"),
            Self::Pattern(pattern) => write!(f, "{pattern}"),
            Self::Pages(base) => {
                write!(f, "{base}{SEPARATOR}{OFFSET_PREFIX}*{SEPARATOR}{LIMIT_PREFIX}*")
            }
        }
    }
}

impl From<CacheKey> for Invalidation {
    fn from(key: CacheKey) -> Self {
        Self::Exact(key)
    }
}

impl From<&CacheKey> for Invalidation {
    fn from(key: &CacheKey) -> Self {
        Self::Exact(key.clone())
    }
}

impl From<KeyPattern> for Invalidation {
    fn from(pattern: KeyPattern) -> Self {
        Self::Pattern(pattern)
    }
}
