use uuid::Uuid;

/// Per-request context threaded through every lifecycle call.
///
/// The request id ends up in tracing spans, in the `operations` audit rows and
/// in the `X-Request-Id` header sent to the remote admin API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationContext {
    pub request_id: String,
}

impl OperationContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_request_id(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
        }
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new()
    }
}
