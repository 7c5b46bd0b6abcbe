use std::collections::HashMap;
use std::fmt::Display;

use anyhow::{bail, Error};

use crate::xmpp::jid::Jid;

use super::stream::StreamId;

/// An RFC 5646-ish language tag, carried verbatim — this server never needs
/// to do more than echo it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageTag(String);

impl LanguageTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }
}

impl Display for LanguageTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The parsed attributes of a `<stream:stream>` open tag, in either
/// direction.
#[derive(Debug, Clone)]
pub struct StreamHeader {
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub id: Option<StreamId>,
    pub version: Option<String>,
    pub lang: Option<LanguageTag>,
}

impl StreamHeader {
    pub fn new(to: Option<Jid>) -> Self {
        Self {
            from: None,
            to,
            id: None,
            version: Some("1.0".to_string()),
            lang: None,
        }
    }

    pub fn with_from(mut self, from: Jid) -> Self {
        self.from = Some(from);
        self
    }

    pub fn is_version_1_0(&self) -> bool {
        self.version.as_deref() == Some("1.0")
    }

    /// Builds a `StreamHeader` from the raw attribute map the XML parser
    /// hands back for a `<stream:stream>` start tag.
    pub fn from_attributes(
        attributes: &HashMap<(String, Option<String>), String>,
    ) -> Result<Self, Error> {
        let to = attributes
            .get(&("to".to_string(), None))
            .map(|s| s.parse::<Jid>())
            .transpose()?;
        let from = attributes
            .get(&("from".to_string(), None))
            .map(|s| s.parse::<Jid>())
            .transpose()?;
        let id = attributes
            .get(&("id".to_string(), None))
            .map(|_| StreamId::new());
        let version = attributes.get(&("version".to_string(), None)).cloned();
        let lang = attributes
            .get(&(
                "lang".to_string(),
                Some(crate::xml::namespaces::XML.to_string()),
            ))
            .map(|s| LanguageTag::new(s.clone()));

        if to.is_none() && from.is_none() {
            // A client stream header always has at least `to`; servers
            // reject via `improper-addressing` further up the chain.
            bail!("stream header is missing both `to` and `from`");
        }

        Ok(Self {
            from,
            to,
            id,
            version,
            lang,
        })
    }
}
