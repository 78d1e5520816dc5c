use thiserror::Error;

/// Operator-authored, user-facing error.
///
/// Friendly errors are produced at boundary decisions (unmanaged namespace,
/// malformed manifests, illegal dev-mode configurations, cluster-scoped
/// resources in a manifest) and are surfaced verbatim to the RPC caller.
/// Everything else travels as an `anyhow::Error` with short context strings
/// added at each boundary it crosses.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct FriendlyError {
    pub message: String,
    /// Transient errors are expected to resolve on their own (e.g. a
    /// namespace that is still terminating); the caller may retry.
    pub transient: bool,
}

impl FriendlyError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }
}

/// Extract the message to show a user from an error chain.
///
/// If a `FriendlyError` is anywhere in the chain its message is returned
/// verbatim; otherwise the printable message of the outermost error.
pub fn user_message(err: &anyhow::Error) -> String {
    for cause in err.chain() {
        if let Some(friendly) = cause.downcast_ref::<FriendlyError>() {
            return friendly.message.clone();
        }
    }
    format!("{err:#}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn friendly_message_survives_context() {
        let err = anyhow::Error::from(FriendlyError::new("namespace is not managed by Kelda"))
            .context("creating workspace");
        assert_eq!(user_message(&err), "namespace is not managed by Kelda");
    }

    #[test]
    fn contextual_errors_render_the_chain() {
        let err = anyhow::anyhow!("connection refused").context("listing pods");
        assert_eq!(user_message(&err), "listing pods: connection refused");
    }
}
