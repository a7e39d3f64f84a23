//! Configuration template resolution.
//!
//! Stdio backend configs may reference `${userId}`, `${userEmail}`,
//! `${sessionId}`, `${requestId}`, and `${timestamp}` in the command,
//! arguments, environment values, and working directory. Resolution
//! collects every problem before failing so an operator sees the full
//! list at once.

use crate::{
    config::{BackendConfig, TransportConfig},
    error::{BridgeError, BridgeResult},
    lifecycle::RequestContext,
};

/// Resolve all template placeholders in a backend config against a request
/// context. Non-stdio transports pass through unchanged.
pub fn resolve_backend(
    config: &BackendConfig,
    context: &RequestContext,
) -> BridgeResult<BackendConfig> {
    let TransportConfig::Stdio {
        command,
        args,
        env,
        cwd,
    } = &config.transport
    else {
        return Ok(config.clone());
    };

    let mut errors = Vec::new();

    let command = resolve_str(command, context, &mut errors);
    let args = args
        .iter()
        .map(|a| resolve_str(a, context, &mut errors))
        .collect();
    let env = env
        .iter()
        .map(|(k, v)| (k.clone(), resolve_str(v, context, &mut errors)))
        .collect();
    let cwd = cwd.as_ref().map(|c| resolve_str(c, context, &mut errors));

    if !errors.is_empty() {
        return Err(BridgeError::ConfigTemplateInvalid(errors));
    }

    let mut resolved = config.clone();
    resolved.transport = TransportConfig::Stdio {
        command,
        args,
        env,
        cwd,
    };
    Ok(resolved)
}

fn resolve_str(input: &str, context: &RequestContext, errors: &mut Vec<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match lookup(name, context) {
                    Lookup::Value(value) => out.push_str(&value),
                    Lookup::Unavailable => errors.push(format!(
                        "'${{{}}}' is not available in this context",
                        name
                    )),
                    Lookup::Unknown => {
                        errors.push(format!("unknown template variable '${{{}}}'", name))
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                errors.push(format!("unterminated template expression in '{}'", input));
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}

enum Lookup {
    Value(String),
    Unavailable,
    Unknown,
}

fn lookup(name: &str, context: &RequestContext) -> Lookup {
    let value = match name {
        "userId" => context.user_id.clone(),
        "userEmail" => context.user_email.clone(),
        "sessionId" => context.session_id.clone(),
        "requestId" => Some(context.request_id.clone()),
        "timestamp" => Some(context.timestamp.to_rfc3339()),
        _ => return Lookup::Unknown,
    };
    match value {
        Some(value) => Lookup::Value(value),
        None => Lookup::Unavailable,
    }
}
