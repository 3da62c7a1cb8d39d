//! Error taxonomy shared by the platform client and the tracker adapters.

/// An error from a remote API, classified by kind.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Credentials rejected by the remote.
    #[error("authentication failed: {context}")]
    Authentication {
        /// What was being authenticated.
        context: String,
    },
    /// The named resource definitively does not exist.
    #[error("not found: {context}")]
    NotFound {
        /// What was being looked up.
        context: String,
    },
    /// The remote returned a structurally invalid response.
    #[error("invalid response: {context}")]
    Protocol {
        /// What is wrong with the response.
        context: String,
    },
    /// Network I/O failure.
    #[error("transport error: {context}")]
    Transport {
        /// What was being transferred.
        context: String,
        /// Underlying HTTP error.
        #[source]
        source: reqwest::Error,
    },
    /// A tracker-specific constraint was violated.
    #[error("{context}")]
    Adapter {
        /// Description of the violated constraint.
        context: String,
    },
}

impl ApiError {
    /// Shorthand for a protocol error.
    pub fn protocol(context: impl Into<String>) -> Self {
        Self::Protocol {
            context: context.into(),
        }
    }

    /// Shorthand for an adapter error.
    pub fn adapter(context: impl Into<String>) -> Self {
        Self::Adapter {
            context: context.into(),
        }
    }

    /// Wrap an HTTP error with context.
    pub fn transport(context: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Transport {
            context: context.into(),
            source,
        }
    }
}

/// Render an error and its cause chain as one compact multi-line string,
/// causes indented below their effect.
pub fn error_chain(error: &dyn std::error::Error) -> String {
    let mut lines = vec![error.to_string()];
    let mut indent = 1;
    let mut cause = error.source();
    while let Some(current) = cause {
        lines.push(format!("{}{current}", "  ".repeat(indent)));
        indent += 1;
        cause = current.source();
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer failure")]
    struct Outer {
        #[source]
        source: ApiError,
    }

    #[test]
    fn chain_renders_causes_indented() {
        let error = Outer {
            source: ApiError::protocol("missing field `id`"),
        };
        let chain = error_chain(&error);
        assert_eq!(
            chain,
            "outer failure\n  invalid response: missing field `id`"
        );
    }
}
