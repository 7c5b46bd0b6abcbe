use std::sync::Arc;

use confidante_core::xmpp::jid::Jid;

use crate::session_index::SessionIndex;

/// Resource allocation policy for bind negotiation, `spec.md` §4.6: use the
/// client's requested resource if it's free on that bare JID, otherwise
/// fall back to a randomly generated one. Layered directly on
/// `SessionIndex` so "resource is bound" and "resource is in the session
/// index" are the same fact, checked against the same map.
pub struct ResourceManager {
    session_index: Arc<SessionIndex>,
}

impl ResourceManager {
    pub fn new(session_index: Arc<SessionIndex>) -> Self {
        Self { session_index }
    }

    /// Resolves the resource to bind for `bare_jid`, given the client's
    /// optional request.
    pub fn resolve(&self, bare_jid: &Jid, requested: Option<String>) -> String {
        match requested {
            Some(resource) if !resource.is_empty() => {
                if self.session_index.resource_is_taken(bare_jid, &resource) {
                    Self::generate()
                } else {
                    resource
                }
            }
            _ => Self::generate(),
        }
    }

    fn generate() -> String {
        uuid::Uuid::new_v4().to_string()
    }
}
