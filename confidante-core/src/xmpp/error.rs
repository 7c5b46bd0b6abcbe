use crate::xml::namespaces;
use crate::xml::Element;

/// Stream-level error conditions, RFC 6120 §4.9.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorCondition {
    BadFormat,
    Conflict,
    ConnectionTimeout,
    HostUnknown,
    ImproperAddressing,
    InternalServerError,
    InvalidNamespace,
    NotAuthorized,
    NotWellFormed,
    PolicyViolation,
    RestrictedXml,
    UnsupportedStanzaType,
    UnsupportedVersion,
}

impl StreamErrorCondition {
    fn tag(self) -> &'static str {
        match self {
            StreamErrorCondition::BadFormat => "bad-format",
            StreamErrorCondition::Conflict => "conflict",
            StreamErrorCondition::ConnectionTimeout => "connection-timeout",
            StreamErrorCondition::HostUnknown => "host-unknown",
            StreamErrorCondition::ImproperAddressing => "improper-addressing",
            StreamErrorCondition::InternalServerError => "internal-server-error",
            StreamErrorCondition::InvalidNamespace => "invalid-namespace",
            StreamErrorCondition::NotAuthorized => "not-authorized",
            StreamErrorCondition::NotWellFormed => "not-well-formed",
            StreamErrorCondition::PolicyViolation => "policy-violation",
            StreamErrorCondition::RestrictedXml => "restricted-xml",
            StreamErrorCondition::UnsupportedStanzaType => "unsupported-stanza-type",
            StreamErrorCondition::UnsupportedVersion => "unsupported-version",
        }
    }
}

impl From<StreamErrorCondition> for Element {
    fn from(condition: StreamErrorCondition) -> Self {
        let mut error = Element::new("error", Some(namespaces::XMPP_STREAMS));
        error.add_child(Element::new(
            condition.tag(),
            Some(namespaces::XMPP_STREAM_ERRORS),
        ));
        error
    }
}

/// `<iq>`/`<message>`/`<presence>` stanza error conditions, RFC 6120 §8.3.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    BadRequest,
    FeatureNotImplemented,
    Forbidden,
    ItemNotFound,
    JidMalformed,
    NotAcceptable,
    NotAllowed,
    NotAuthorized,
    RecipientUnavailable,
    RemoteServerNotFound,
    RemoteServerTimeout,
    ServiceUnavailable,
    SubscriptionRequired,
    UndefinedCondition,
    InternalServerError,
}

impl StanzaErrorCondition {
    fn tag(self) -> &'static str {
        match self {
            StanzaErrorCondition::BadRequest => "bad-request",
            StanzaErrorCondition::FeatureNotImplemented => "feature-not-implemented",
            StanzaErrorCondition::Forbidden => "forbidden",
            StanzaErrorCondition::ItemNotFound => "item-not-found",
            StanzaErrorCondition::JidMalformed => "jid-malformed",
            StanzaErrorCondition::NotAcceptable => "not-acceptable",
            StanzaErrorCondition::NotAllowed => "not-allowed",
            StanzaErrorCondition::NotAuthorized => "not-authorized",
            StanzaErrorCondition::RecipientUnavailable => "recipient-unavailable",
            StanzaErrorCondition::RemoteServerNotFound => "remote-server-not-found",
            StanzaErrorCondition::RemoteServerTimeout => "remote-server-timeout",
            StanzaErrorCondition::ServiceUnavailable => "service-unavailable",
            StanzaErrorCondition::SubscriptionRequired => "subscription-required",
            StanzaErrorCondition::UndefinedCondition => "undefined-condition",
            StanzaErrorCondition::InternalServerError => "internal-server-error",
        }
    }

    /// The `type` attribute recommended by RFC 6120 §8.3.2 for this condition.
    pub fn default_type(self) -> ErrorType {
        match self {
            StanzaErrorCondition::BadRequest
            | StanzaErrorCondition::JidMalformed
            | StanzaErrorCondition::NotAcceptable
            | StanzaErrorCondition::UndefinedCondition => ErrorType::Modify,
            StanzaErrorCondition::Forbidden
            | StanzaErrorCondition::NotAllowed
            | StanzaErrorCondition::NotAuthorized
            | StanzaErrorCondition::SubscriptionRequired => ErrorType::Auth,
            StanzaErrorCondition::ItemNotFound
            | StanzaErrorCondition::RemoteServerNotFound
            | StanzaErrorCondition::ServiceUnavailable => ErrorType::Cancel,
            StanzaErrorCondition::RecipientUnavailable | StanzaErrorCondition::RemoteServerTimeout => {
                ErrorType::Wait
            }
            StanzaErrorCondition::FeatureNotImplemented => ErrorType::Cancel,
            StanzaErrorCondition::InternalServerError => ErrorType::Wait,
        }
    }
}

/// The stanza-level `type` attribute of `<error>`, RFC 6120 §8.3.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Auth,
    Cancel,
    Continue,
    Modify,
    Wait,
}

impl ErrorType {
    fn as_str(self) -> &'static str {
        match self {
            ErrorType::Auth => "auth",
            ErrorType::Cancel => "cancel",
            ErrorType::Continue => "continue",
            ErrorType::Modify => "modify",
            ErrorType::Wait => "wait",
        }
    }
}

/// Builds a `<error type='...'><condition/></error>` element suitable for
/// appending to a bounced stanza.
pub fn stanza_error(condition: StanzaErrorCondition, error_type: Option<ErrorType>) -> Element {
    let error_type = error_type.unwrap_or_else(|| condition.default_type());
    let mut error = Element::new("error", None);
    error.set_attribute("type", None, error_type.as_str().to_string());
    error.add_child(Element::new(condition.tag(), Some(namespaces::XMPP_STANZAS)));
    error
}
