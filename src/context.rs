use bytes::Bytes;

/// Per-request values threaded through dispatch and recording. Built once
/// after resolution and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    owner_id: String,
    organization_id: String,
    session_id: String,
    interaction_id: String,
    original_request: Bytes,
}

impl RequestContext {
    pub fn new(
        owner_id: impl Into<String>,
        organization_id: impl Into<String>,
        session_id: impl Into<String>,
        interaction_id: impl Into<String>,
        original_request: Bytes,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            organization_id: organization_id.into(),
            session_id: session_id.into(),
            interaction_id: interaction_id.into(),
            original_request,
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Empty unless the resolved endpoint is organization-owned.
    pub fn organization_id(&self) -> &str {
        &self.organization_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn interaction_id(&self) -> &str {
        &self.interaction_id
    }

    /// Raw inbound body, kept for audit and billing collaborators.
    pub fn original_request(&self) -> &Bytes {
        &self.original_request
    }
}
