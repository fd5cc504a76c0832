//! Node URLs and body locations.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::IdError;

const SCHEME: &str = "pa://";

/// Resolvable address of a node hosting bodies: `pa://{host}/{node-name}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeUrl {
    host: String,
    name: String,
}

impl NodeUrl {
    /// Builds a node URL from its parts.
    pub fn new(host: impl Into<String>, name: impl Into<String>) -> Result<Self, IdError> {
        let host = host.into();
        let name = name.into();
        validate_segment(&host, "host")?;
        validate_segment(&name, "node name")?;
        Ok(Self { host, name })
    }

    /// Host part of the URL.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Node name part of the URL.
    pub fn name(&self) -> &str {
        &self.name
    }
}

fn validate_segment(segment: &str, what: &str) -> Result<(), IdError> {
    let invalid = |message: String| IdError::InvalidNodeUrl {
        url: segment.to_string(),
        message,
    };

    if segment.is_empty() {
        return Err(invalid(format!("{} is empty", what)));
    }
    if segment.contains('/') || segment.chars().any(char::is_whitespace) {
        return Err(invalid(format!("{} contains '/' or whitespace", what)));
    }
    Ok(())
}

impl fmt::Display for NodeUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}/{}", SCHEME, self.host, self.name)
    }
}

impl FromStr for NodeUrl {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let rest = s.strip_prefix(SCHEME).ok_or_else(|| IdError::InvalidNodeUrl {
            url: s.to_string(),
            message: format!("expected scheme '{}'", SCHEME),
        })?;

        let (host, name) = rest.split_once('/').ok_or_else(|| IdError::InvalidNodeUrl {
            url: s.to_string(),
            message: "missing node name".to_string(),
        })?;

        Self::new(host, name).map_err(|_| IdError::InvalidNodeUrl {
            url: s.to_string(),
            message: "malformed host or node name".to_string(),
        })
    }
}

impl TryFrom<String> for NodeUrl {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeUrl> for String {
    fn from(url: NodeUrl) -> Self {
        url.to_string()
    }
}

/// Where a body currently lives.
///
/// `epoch` starts at zero when the body is created and increases by one on
/// every completed migration, so two locations for the same body are ordered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub node: NodeUrl,
    pub epoch: u64,
}

impl Location {
    /// Location of a freshly created body.
    pub fn initial(node: NodeUrl) -> Self {
        Self { node, epoch: 0 }
    }

    /// The location a body occupies after migrating to `node`.
    #[must_use]
    pub fn moved_to(&self, node: NodeUrl) -> Self {
        Self {
            node,
            epoch: self.epoch + 1,
        }
    }

    /// Returns true if `self` supersedes `other`.
    pub fn is_newer_than(&self, other: &Location) -> bool {
        self.epoch > other.epoch
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.node, self.epoch)
    }
}
