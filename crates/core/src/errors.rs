use thiserror::Error;

/// Failure classes a request can run into between ingress and reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Enhancement,
    ToolValidation,
    ToolExecution,
    PlannerCall,
    LimitExceeded,
    Formatter,
    Redaction,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enhancement => "enhancement_failure",
            Self::ToolValidation => "tool_validation_failure",
            Self::ToolExecution => "tool_execution_failure",
            Self::PlannerCall => "planner_call_failure",
            Self::LimitExceeded => "limit_exceeded",
            Self::Formatter => "formatter_failure",
            Self::Redaction => "redaction_failure",
        }
    }

    /// Whether the request still produces a useful answer after this failure.
    pub fn is_recoverable(self) -> bool {
        !matches!(self, Self::PlannerCall | Self::Redaction)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("tool result references unknown call id `{0}`")]
    UnknownCallId(String),
    #[error("turn {turn} exceeds the configured limit of {max}")]
    TurnLimit { turn: u32, max: u32 },
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("planner failure: {0}")]
    Planner(String),
    #[error("redaction failure: {0}")]
    Redaction(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::ServiceUnavailable { .. } => {
                "I couldn't complete the investigation right now. Please retry shortly."
            }
            Self::Internal { .. } => "Sorry, something went wrong while preparing the response.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }

    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::Planner(_) => Some(FailureKind::PlannerCall),
            Self::Redaction(_) => Some(FailureKind::Redaction),
            Self::Domain(DomainError::TurnLimit { .. }) => Some(FailureKind::LimitExceeded),
            _ => None,
        }
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        match value {
            ApplicationError::Domain(error) => Self::BadRequest {
                message: error.to_string(),
                correlation_id: "unassigned".to_owned(),
            },
            ApplicationError::Planner(message) | ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, correlation_id: "unassigned".to_owned() }
            }
            ApplicationError::Redaction(message) | ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: "unassigned".to_owned() }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::errors::{ApplicationError, DomainError, FailureKind, InterfaceError};

    #[test]
    fn domain_error_maps_to_bad_request_interface_error() {
        let interface =
            ApplicationError::from(DomainError::UnknownCallId("toolu_9".to_owned()))
                .into_interface("req-1");

        assert!(matches!(
            interface,
            InterfaceError::BadRequest {
                ref correlation_id,
                ..
            } if correlation_id == "req-1"
        ));
        assert_eq!(interface.correlation_id(), "req-1");
    }

    #[test]
    fn planner_error_maps_to_service_unavailable() {
        let interface =
            ApplicationError::Planner("overloaded".to_owned()).into_interface("req-2");

        assert!(matches!(interface, InterfaceError::ServiceUnavailable { .. }));
        assert_eq!(
            interface.user_message(),
            "I couldn't complete the investigation right now. Please retry shortly."
        );
    }

    #[test]
    fn redaction_error_user_message_hides_internals() {
        let interface = ApplicationError::Redaction("pattern `(` failed: unclosed group".to_owned())
            .into_interface("req-3");

        assert!(matches!(interface, InterfaceError::Internal { .. }));
        assert!(!interface.user_message().contains("pattern"));
    }

    #[test]
    fn failure_kinds_classify_recoverability() {
        assert!(FailureKind::Enhancement.is_recoverable());
        assert!(FailureKind::ToolExecution.is_recoverable());
        assert!(FailureKind::Formatter.is_recoverable());
        assert!(!FailureKind::PlannerCall.is_recoverable());
        assert!(!FailureKind::Redaction.is_recoverable());
        assert_eq!(
            ApplicationError::Redaction("x".to_owned()).kind(),
            Some(FailureKind::Redaction)
        );
        assert_eq!(FailureKind::LimitExceeded.to_string(), "limit_exceeded");
    }
}
