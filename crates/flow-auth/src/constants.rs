//! Google Labs Flow endpoints and cookie names
//!
//! These identify public product surfaces. The secrets themselves (AT/ST
//! values) live in the credential store.

/// Origin of the Flow web product
pub const LABS_ORIGIN: &str = "https://labs.google";

/// Session endpoint: trades the AT cookie for a short-lived bearer (our ST)
pub const SESSION_ENDPOINT: &str = "https://labs.google/fx/api/auth/session";

/// Flow tool landing page, used when a credential has no project
pub const FLOW_TOOL_URL: &str = "https://labs.google/fx/tools/flow";

/// Cookie carrying the long-lived access token (AT)
pub const SESSION_COOKIE: &str = "__Secure-next-auth.session-token";

/// Page a browser session opens to re-authenticate a credential.
pub fn project_url(project_id: Option<&str>) -> String {
    match project_id {
        Some(id) if !id.is_empty() => format!("{FLOW_TOOL_URL}/project/{id}"),
        _ => FLOW_TOOL_URL.to_string(),
    }
}
