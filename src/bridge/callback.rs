//! Where an answer is written back on-chain.
//!
//! Trust boundary: an `External` callback names an arbitrary entry point
//! taken verbatim from event data. Nothing here checks that the target is
//! safe to call; the service signer only ever passes `(question, response)`
//! and the callee's own access control decides what that may do. Do not
//! grant the service key capabilities beyond paying for these calls.

use crate::bridge::BridgeError;
use crate::ledger::{MoveCall, Operation};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callback {
    /// Write into the prompt object's answer field.
    Populate,
    External {
        package: String,
        module: String,
        function: String,
    },
}

impl Callback {
    /// Absent or blank means `Populate`; otherwise exactly three non-empty
    /// `::`-separated parts.
    pub fn parse(raw: Option<&str>) -> Result<Self, BridgeError> {
        let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
            return Ok(Self::Populate);
        };

        let parts: Vec<&str> = raw.split("::").collect();
        match parts.as_slice() {
            [package, module, function]
                if !package.is_empty() && !module.is_empty() && !function.is_empty() =>
            {
                Ok(Self::External {
                    package: package.to_string(),
                    module: module.to_string(),
                    function: function.to_string(),
                })
            }
            _ => Err(BridgeError::MalformedCallback(raw.to_string())),
        }
    }

    /// The transaction body delivering `response`.
    pub fn operation(&self, prompt_id: &str, requester: &str, question: &str, response: &str) -> Operation {
        match self {
            Self::Populate => Operation::PopulateAnswer {
                prompt: prompt_id.to_string(),
                requester: requester.to_string(),
                response: response.to_string(),
            },
            Self::External {
                package,
                module,
                function,
            } => Operation::Call(MoveCall {
                package: package.clone(),
                module: module.clone(),
                function: function.clone(),
                arguments: vec![question.into(), response.into()],
            }),
        }
    }
}

impl fmt::Display for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Populate => write!(f, "prompt::populate"),
            Self::External {
                package,
                module,
                function,
            } => write!(f, "{package}::{module}::{function}"),
        }
    }
}
