//! Visitor identity and per-visit session ids.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Attributes audience filters are evaluated against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitorAttributes {
    pub user_type: Option<String>,
    pub country: Option<String>,
    pub device: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visitor {
    pub session_id: String,
    pub user_id: Option<String>,
    #[serde(default)]
    pub attributes: VisitorAttributes,
}

impl Visitor {
    pub fn anonymous(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: None,
            attributes: VisitorAttributes::default(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_attributes(mut self, attributes: VisitorAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Hash seed and unique-visitor key: the user id when signed in, else the session.
    pub fn identity(&self) -> &str {
        self.user_id.as_deref().unwrap_or(&self.session_id)
    }
}

/// Session id: S-<epoch_ms>-<16 hex chars>
pub fn new_session_id(now_ms: u64) -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    format!("S-{}-{}", now_ms, hex::encode(bytes))
}

/// Supplies the visitor for calls that don't name one explicitly.
pub trait IdentityProvider {
    fn current(&self) -> &Visitor;
}

/// One session per visit; sign-in attaches a user id without changing the session.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    visitor: Visitor,
}

impl SessionIdentity {
    pub fn start(now_ms: u64) -> Self {
        Self { visitor: Visitor::anonymous(new_session_id(now_ms)) }
    }

    pub fn from_visitor(visitor: Visitor) -> Self {
        Self { visitor }
    }

    pub fn sign_in(&mut self, user_id: impl Into<String>) {
        self.visitor.user_id = Some(user_id.into());
    }

    pub fn sign_out(&mut self) {
        self.visitor.user_id = None;
    }

    pub fn set_attributes(&mut self, attributes: VisitorAttributes) {
        self.visitor.attributes = attributes;
    }
}

impl IdentityProvider for SessionIdentity {
    fn current(&self) -> &Visitor {
        &self.visitor
    }
}
