//! Tool name namespacing
//!
//! Downstream tools are exposed as `{server_name}__{tool_name}`
//! (e.g., `github__create_issue`). The server part is sanitized so it can
//! never contain characters a client would reject.

/// Separator between the server name and the tool name
pub const TOOL_SEPARATOR: &str = "__";

/// Parsed tool name with server prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedToolName {
    /// The server name prefix (e.g., "github")
    pub server_name: String,
    /// The original tool name (e.g., "create_issue")
    pub tool_name: String,
}

/// Replace anything outside `[A-Za-z0-9_-]` with `_`
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Create a prefixed tool name
pub fn prefix_tool_name(server_name: &str, tool_name: &str) -> String {
    format!("{}{}{}", sanitize_name(server_name), TOOL_SEPARATOR, tool_name)
}

/// Split a prefixed tool name at the first separator
pub fn parse_tool_name(prefixed_name: &str) -> Option<ParsedToolName> {
    let (server_name, tool_name) = prefixed_name.split_once(TOOL_SEPARATOR)?;
    if server_name.is_empty() || tool_name.is_empty() {
        return None;
    }
    Some(ParsedToolName {
        server_name: server_name.to_string(),
        tool_name: tool_name.to_string(),
    })
}
