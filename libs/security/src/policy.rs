//! Communication policies.
//!
//! A policy decides, for a kind of communication between two sets of
//! entities, whether it is allowed at all and which protections it needs.
//! Both ends of a session evaluate their own rules; the results are combined
//! and a `Required`/`Denied` disagreement forbids the communication.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Whether a protection (authentication, integrity, confidentiality) is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Requirement {
    Required,
    #[default]
    Optional,
    Denied,
}

impl Requirement {
    /// Merges two requirements. `None` means the two sides conflict.
    pub fn combine(self, other: Requirement) -> Option<Requirement> {
        use Requirement::*;
        match (self, other) {
            (Required, Denied) | (Denied, Required) => None,
            (Required, _) | (_, Required) => Some(Required),
            (Denied, _) | (_, Denied) => Some(Denied),
            (Optional, Optional) => Some(Optional),
        }
    }
}

/// The kind of interaction a policy applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommunicationKind {
    Request,
    Reply,
    Migration,
    Custom(String),
}

impl fmt::Display for CommunicationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommunicationKind::Request => write!(f, "request"),
            CommunicationKind::Reply => write!(f, "reply"),
            CommunicationKind::Migration => write!(f, "migration"),
            CommunicationKind::Custom(name) => write!(f, "{}", name),
        }
    }
}

/// Protection attributes for one communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Communication {
    pub allowed: bool,
    pub authentication: Requirement,
    pub integrity: Requirement,
    pub confidentiality: Requirement,
}

impl Communication {
    /// Allowed, nothing required.
    pub const fn open() -> Self {
        Self {
            allowed: true,
            authentication: Requirement::Optional,
            integrity: Requirement::Optional,
            confidentiality: Requirement::Optional,
        }
    }

    /// Allowed, every protection required.
    pub const fn secured() -> Self {
        Self {
            allowed: true,
            authentication: Requirement::Required,
            integrity: Requirement::Required,
            confidentiality: Requirement::Required,
        }
    }

    /// Not allowed.
    pub const fn forbidden() -> Self {
        Self {
            allowed: false,
            authentication: Requirement::Optional,
            integrity: Requirement::Optional,
            confidentiality: Requirement::Optional,
        }
    }

    /// True if any protection is required, which means a session must exist.
    pub fn requires_session(&self) -> bool {
        self.allowed
            && [self.authentication, self.integrity, self.confidentiality]
                .contains(&Requirement::Required)
    }

    /// Merges the two sides' views. Conflicting requirements forbid the communication.
    #[must_use]
    pub fn combine(&self, other: &Communication) -> Communication {
        if !self.allowed || !other.allowed {
            return Communication::forbidden();
        }

        let merged = (
            self.authentication.combine(other.authentication),
            self.integrity.combine(other.integrity),
            self.confidentiality.combine(other.confidentiality),
        );

        match merged {
            (Some(authentication), Some(integrity), Some(confidentiality)) => Communication {
                allowed: true,
                authentication,
                integrity,
                confidentiality,
            },
            _ => Communication::forbidden(),
        }
    }
}

impl Default for Communication {
    fn default() -> Self {
        Self::open()
    }
}

/// Category of a security entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Runtime,
    Node,
    VirtualNode,
    Object,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityKind::Runtime => "runtime",
            EntityKind::Node => "node",
            EntityKind::VirtualNode => "vn",
            EntityKind::Object => "object",
        };
        write!(f, "{}", s)
    }
}

/// A named principal a body belongs to (its runtime, node, virtual node, itself).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity {
    pub kind: EntityKind,
    pub name: String,
}

impl Entity {
    pub fn new(kind: EntityKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// Matches entities in a policy rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityPattern {
    Any,
    Named { kind: EntityKind, name: String },
    /// Any entity with this name regardless of kind.
    Name(String),
}

impl EntityPattern {
    pub fn named(kind: EntityKind, name: impl Into<String>) -> Self {
        EntityPattern::Named {
            kind,
            name: name.into(),
        }
    }

    fn matches(&self, entity: &Entity) -> bool {
        match self {
            EntityPattern::Any => true,
            EntityPattern::Named { kind, name } => entity.kind == *kind && entity.name == *name,
            EntityPattern::Name(name) => entity.name == *name,
        }
    }

    fn matches_any(&self, entities: &[Entity]) -> bool {
        matches!(self, EntityPattern::Any) || entities.iter().any(|e| self.matches(e))
    }
}

/// One rule: for `kind` (or every kind when `None`) from `from` to `to`, apply `communication`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub kind: Option<CommunicationKind>,
    pub from: EntityPattern,
    pub to: EntityPattern,
    pub communication: Communication,
}

impl PolicyRule {
    fn applies(&self, kind: &CommunicationKind, from: &[Entity], to: &[Entity]) -> bool {
        self.kind.as_ref().is_none_or(|k| k == kind)
            && self.from.matches_any(from)
            && self.to.matches_any(to)
    }
}

/// Ordered rule list; the first matching rule wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyServer {
    rules: Vec<PolicyRule>,
    default: Communication,
}

impl PolicyServer {
    /// A policy server with no rules and the given fallback.
    pub fn new(default: Communication) -> Self {
        Self {
            rules: Vec::new(),
            default,
        }
    }

    /// Appends a rule.
    #[must_use]
    pub fn with_rule(mut self, rule: PolicyRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Forbids `kind` from `from` to `to`.
    #[must_use]
    pub fn forbid(self, kind: CommunicationKind, from: EntityPattern, to: EntityPattern) -> Self {
        self.with_rule(PolicyRule {
            kind: Some(kind),
            from,
            to,
            communication: Communication::forbidden(),
        })
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    /// The policy for `kind` from the `from` entities to the `to` entities.
    pub fn policy_to(
        &self,
        kind: &CommunicationKind,
        from: &[Entity],
        to: &[Entity],
    ) -> Communication {
        self.rules
            .iter()
            .find(|rule| rule.applies(kind, from, to))
            .map(|rule| rule.communication)
            .unwrap_or(self.default)
    }

    /// Resolves a context: fills `resolved` with the proposal merged with local policy.
    pub fn policy(&self, mut context: SecurityContext) -> SecurityContext {
        let local = self.policy_to(&context.kind, &context.from, &context.to);
        context.resolved = Some(match &context.proposed {
            Some(proposed) => proposed.combine(&local),
            None => local,
        });
        context
    }
}

impl Default for PolicyServer {
    fn default() -> Self {
        Self::new(Communication::open())
    }
}

/// A policy question with an optional proposal, answered by [`PolicyServer::policy`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityContext {
    pub kind: CommunicationKind,
    pub from: Vec<Entity>,
    pub to: Vec<Entity>,
    pub proposed: Option<Communication>,
    pub resolved: Option<Communication>,
}

impl SecurityContext {
    pub fn new(kind: CommunicationKind, from: Vec<Entity>, to: Vec<Entity>) -> Self {
        Self {
            kind,
            from,
            to,
            proposed: None,
            resolved: None,
        }
    }
}

pub(crate) fn describe(entities: &[Entity]) -> String {
    entities
        .iter()
        .map(Entity::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
