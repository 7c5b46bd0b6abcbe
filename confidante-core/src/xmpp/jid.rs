use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::{Error, bail};
use regex::Regex;

const MAX_PART_BYTES: usize = 1023;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct DomainPart(String);

impl Display for DomainPart {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct LocalPart(String);

impl Display for LocalPart {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct ResourcePart(String);

impl Display for ResourcePart {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A JID of the form `local@domain/resource`, per RFC 6120 §2 / `spec.md` §3.
///
/// Parsing case-folds `local` and `domain` to lowercase and validates
/// structure; `resource` is preserved byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Jid {
    local: Option<LocalPart>,
    domain: DomainPart,
    resource: Option<ResourcePart>,
}

impl Jid {
    pub fn new(local: Option<String>, domain: String, resource: Option<String>) -> Self {
        Self {
            local: local.map(LocalPart),
            domain: DomainPart(domain),
            resource: resource.map(ResourcePart),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain.0
    }

    pub fn local(&self) -> Option<&str> {
        self.local.as_ref().map(|l| l.0.as_str())
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_ref().map(|r| r.0.as_str())
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    /// Drops the resourcepart, if any.
    pub fn to_bare(&self) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    /// Returns a copy of this JID, addressed to the given bare domain (no localpart, no resource).
    pub fn domain_only(&self) -> Jid {
        Jid {
            local: None,
            domain: self.domain.clone(),
            resource: None,
        }
    }

    /// Returns a new JID with `resource` attached, replacing any existing one.
    pub fn bind(&self, resource: String) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: Some(ResourcePart(resource)),
        }
    }

    /// True if `other`, stripped of its resource, equals this JID's bare form.
    pub fn bare_matches(&self, other: &Jid) -> bool {
        self.to_bare() == other.to_bare()
    }
}

fn validate_localpart(s: &str) -> Result<String, Error> {
    if s.is_empty() {
        bail!("localpart must not be empty");
    }
    if s.len() > MAX_PART_BYTES {
        bail!("localpart exceeds {MAX_PART_BYTES} bytes");
    }
    if s.contains(['@', '/', '"', '&', '\'', '/', ':', '<', '>']) || s.chars().any(|c| c.is_control())
    {
        bail!("localpart contains forbidden characters");
    }
    Ok(s.to_lowercase())
}

fn validate_domainpart(s: &str) -> Result<String, Error> {
    if s.is_empty() {
        bail!("domainpart must not be empty");
    }
    if s.len() > MAX_PART_BYTES {
        bail!("domainpart exceeds {MAX_PART_BYTES} bytes");
    }
    if s.starts_with('.') || s.ends_with('.') || s.contains("..") {
        bail!("domainpart has an empty label");
    }
    for label in s.split('.') {
        if label.is_empty() {
            bail!("domainpart has an empty label");
        }
    }
    if s.chars().any(|c| c.is_control()) {
        bail!("domainpart contains control characters");
    }
    Ok(s.to_lowercase())
}

fn validate_resourcepart(s: &str) -> Result<String, Error> {
    if s.is_empty() {
        bail!("resourcepart must not be empty");
    }
    if s.len() > MAX_PART_BYTES {
        bail!("resourcepart exceeds {MAX_PART_BYTES} bytes");
    }
    if s.chars().any(|c| c.is_control()) {
        bail!("resourcepart contains control characters");
    }
    Ok(s.to_string())
}

impl FromStr for Jid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let regex =
            Regex::new("^(?:(?P<local>[^@/]+)@)?(?P<domain>[^@/]+)(?:/(?P<resource>.+))?$")
                .unwrap();
        let Some(captures) = regex.captures(s) else {
            bail!("could not parse JID: \"{s}\"");
        };

        let local = captures
            .name("local")
            .map(|m| validate_localpart(m.as_str()))
            .transpose()?
            .map(LocalPart);
        let domain = validate_domainpart(
            captures
                .name("domain")
                .ok_or_else(|| anyhow::anyhow!("JID is missing a domainpart"))?
                .as_str(),
        )?;
        let resource = captures
            .name("resource")
            .map(|m| validate_resourcepart(m.as_str()))
            .transpose()?
            .map(ResourcePart);

        Ok(Jid {
            local,
            domain: DomainPart(domain),
            resource,
        })
    }
}

impl Display for Jid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.local {
            Some(local) => write!(f, "{}@{}", local, self.domain)?,
            None => write!(f, "{}", self.domain)?,
        }
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Jid;

    #[test]
    fn fail_on_empty_string() {
        let result = "".parse::<Jid>();
        assert!(result.is_err());
    }

    #[test]
    fn fail_on_empty_domain_label() {
        assert!("alice@".parse::<Jid>().is_err());
        assert!("alice@foo..bar".parse::<Jid>().is_err());
        assert!("alice@.foo".parse::<Jid>().is_err());
        assert!("alice@foo.".parse::<Jid>().is_err());
    }

    #[test]
    fn parses_bare_jid() {
        let jid = "alice@localhost".parse::<Jid>().unwrap();
        assert_eq!(jid.local(), Some("alice"));
        assert_eq!(jid.domain(), "localhost");
        assert_eq!(jid.resource(), None);
    }

    #[test]
    fn parses_full_jid() {
        let jid = "alice@localhost/home".parse::<Jid>().unwrap();
        assert_eq!(jid.resource(), Some("home"));
    }

    #[test]
    fn parses_domain_only() {
        let jid = "localhost".parse::<Jid>().unwrap();
        assert_eq!(jid.local(), None);
        assert_eq!(jid.domain(), "localhost");
    }

    #[test]
    fn case_folds_local_and_domain_but_not_resource() {
        let jid = "Alice@Localhost/Home".parse::<Jid>().unwrap();
        assert_eq!(jid.local(), Some("alice"));
        assert_eq!(jid.domain(), "localhost");
        assert_eq!(jid.resource(), Some("Home"));
    }

    #[test]
    fn round_trips_through_display() {
        for raw in ["alice@localhost", "alice@localhost/home", "localhost"] {
            let jid = raw.parse::<Jid>().unwrap();
            let reparsed = jid.to_string().parse::<Jid>().unwrap();
            assert_eq!(jid, reparsed);
        }
    }

    #[test]
    fn to_bare_drops_resource() {
        let jid = "alice@localhost/home".parse::<Jid>().unwrap();
        assert_eq!(jid.to_bare().to_string(), "alice@localhost");
    }

    #[test]
    fn bind_replaces_resource() {
        let jid = "alice@localhost".parse::<Jid>().unwrap();
        let bound = jid.bind("home".to_string());
        assert_eq!(bound.to_string(), "alice@localhost/home");
    }
}
