//! Resource commands received from the peer bus
//!
//! ```json
//! {"verb":"put","ep":"dev1","path":"/3311/0/5850","value":"1","token":"abc",
//!  "options":{"timeout_ms":5000,"query":{"noResp":"true"}}}
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::correlator::Verb;
use crate::executor::{OperationOptions, OperationRequest, ResourceAddress};
use crate::{Error, Result};

/// Command as it appears on the wire
#[derive(Debug, Clone, Deserialize)]
pub struct PeerCommand {
    pub verb: String,
    #[serde(default, alias = "endpoint")]
    pub ep: Option<String>,
    #[serde(alias = "uri")]
    pub path: String,
    /// Strings pass through; other JSON values are sent as their JSON text
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub options: CommandOptions,
}

/// Optional command tuning
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandOptions {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
}

/// A validated command ready for the executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    /// Token echoed back in the command result
    pub reply_token: String,
    pub request: OperationRequest,
}

impl PeerCommand {
    /// Parse and validate a raw command
    ///
    /// # Errors
    ///
    /// Returns `InvalidCommand` if the body is not a command object, the verb
    /// is unknown, the path is empty, or a write carries no value
    pub fn parse(raw: &[u8]) -> Result<ParsedCommand> {
        let command: Self =
            serde_json::from_slice(raw).map_err(|e| Error::InvalidCommand(e.to_string()))?;
        command.validate()
    }

    fn validate(self) -> Result<ParsedCommand> {
        let verb = Verb::parse(&self.verb)
            .ok_or_else(|| Error::InvalidCommand(format!("unknown verb '{}'", self.verb)))?;

        let path = self.path.trim();
        if path.is_empty() {
            return Err(Error::InvalidCommand("empty resource path".to_string()));
        }
        let uri = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };

        let value = self.value.and_then(|v| match v {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s),
            other => Some(other.to_string()),
        });
        if verb == Verb::Write && value.is_none() {
            return Err(Error::InvalidCommand("write requires a value".to_string()));
        }

        let address = ResourceAddress {
            endpoint: self.ep.filter(|ep| !ep.is_empty()),
            uri,
        };

        let options = OperationOptions {
            timeout: self.options.timeout_ms.map(Duration::from_millis),
            query: self.options.query,
        };

        Ok(ParsedCommand {
            reply_token: self
                .token
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            request: OperationRequest {
                verb,
                address,
                value,
                options,
            },
        })
    }
}

/// Best-effort extraction of the reply token and endpoint from a rejected
/// command so the rejection can still be answered
#[must_use]
pub fn salvage(raw: &[u8]) -> (Option<String>, Option<String>) {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(raw) else {
        return (None, None);
    };
    let field = |name: &str| value.get(name).and_then(|v| v.as_str()).map(String::from);
    (field("token"), field("ep").or_else(|| field("endpoint")))
}
