//! Custom authorizer result evaluation
//!
//! Shared by the HTTP and WebSocket gateways: checks the principal, matches
//! the returned IAM-style policy against the invoked resource ARN and
//! validates the returned context.

use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::{ErrorCode, GatewayError};

/// Principal accepted by an authorizer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthorizedPrincipal {
    pub principal_id: String,
    /// Context values, stringified
    pub context: Map<String, Value>,
    pub usage_identifier_key: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("No principalId set on the Response")]
    MissingPrincipal,

    #[error("User is not authorized to access this resource")]
    Denied,

    #[error("Authorizer response context values must be of type string, number, or boolean")]
    InvalidContext,
}

impl PolicyError {
    pub fn to_gateway_error(&self) -> GatewayError {
        let code = match self {
            Self::Unauthorized => ErrorCode::Unauthorized,
            Self::MissingPrincipal | Self::Denied => ErrorCode::Forbidden,
            Self::InvalidContext => ErrorCode::AuthorizerConfiguration,
        };
        GatewayError::new(code, self.to_string())
    }
}

/// Resource ARN a custom authorizer is asked about
pub fn method_arn(region: &str, stage: &str, method: &str, resource_path: &str) -> String {
    format!(
        "arn:aws:execute-api:{region}:random-account-id:random-api-id/{stage}/{}{resource_path}",
        method.to_uppercase()
    )
}

/// Evaluate a policy-style authorizer result against `method_arn`
pub fn evaluate(result: &Value, method_arn: &str) -> Result<AuthorizedPrincipal, PolicyError> {
    if result.as_str() == Some("Unauthorized") {
        return Err(PolicyError::Unauthorized);
    }

    let principal_id = match result.get("principalId") {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => return Err(PolicyError::MissingPrincipal),
    };

    let policy = result.get("policyDocument").ok_or(PolicyError::Denied)?;
    if !can_execute(policy, method_arn) {
        return Err(PolicyError::Denied);
    }

    let context = validate_context(result.get("context"))?;

    Ok(AuthorizedPrincipal {
        principal_id,
        context,
        usage_identifier_key: result
            .get("usageIdentifierKey")
            .and_then(Value::as_str)
            .map(ToString::to_string),
    })
}

/// Evaluate an HTTP API "simple response" (`{isAuthorized, context}`)
pub fn evaluate_simple(result: &Value) -> Result<AuthorizedPrincipal, PolicyError> {
    if result.as_str() == Some("Unauthorized") {
        return Err(PolicyError::Unauthorized);
    }
    match result.get("isAuthorized") {
        Some(Value::Bool(true)) => Ok(AuthorizedPrincipal {
            principal_id: String::new(),
            context: validate_context(result.get("context"))?,
            usage_identifier_key: None,
        }),
        Some(Value::Bool(false)) => Err(PolicyError::Denied),
        _ => Err(PolicyError::Unauthorized),
    }
}

/// Context values must be primitives; they are handed on as strings
pub fn validate_context(context: Option<&Value>) -> Result<Map<String, Value>, PolicyError> {
    let entries = match context {
        None | Some(Value::Null) => return Ok(Map::new()),
        Some(Value::Object(entries)) => entries,
        Some(_) => return Err(PolicyError::InvalidContext),
    };

    entries
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return Err(PolicyError::InvalidContext),
            };
            Ok((key.clone(), Value::String(value)))
        })
        .collect()
}

/// Any matching `Deny` wins, otherwise some `Allow` must match
pub fn can_execute(policy: &Value, resource: &str) -> bool {
    let statements: Vec<&Value> = match policy.get("Statement") {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(item @ Value::Object(_)) => vec![item],
        _ => return false,
    };

    if statements_match(&statements, resource, "deny") {
        return false;
    }
    statements_match(&statements, resource, "allow")
}

fn statements_match(statements: &[&Value], resource: &str, effect: &str) -> bool {
    statements.iter().any(|statement| {
        let matches_effect = statement
            .get("Effect")
            .and_then(Value::as_str)
            .is_some_and(|e| e.eq_ignore_ascii_case(effect));
        if !matches_effect {
            return false;
        }
        match statement.get("Resource") {
            Some(Value::String(pattern)) => matches_resource(pattern, resource),
            Some(Value::Array(patterns)) => patterns
                .iter()
                .filter_map(Value::as_str)
                .any(|pattern| matches_resource(pattern, resource)),
            _ => false,
        }
    })
}

struct ParsedArn<'a> {
    region: &'a str,
    account_id: &'a str,
    api_id: &'a str,
    path: &'a str,
}

fn parse_arn(arn: &str) -> Option<ParsedArn<'_>> {
    let rest = arn.strip_prefix("arn:aws:execute-api:")?;
    let mut parts = rest.splitn(3, ':');
    let region = parts.next()?;
    let account_id = parts.next()?;
    let (api_id, path) = parts.next()?.split_once('/')?;
    Some(ParsedArn {
        region,
        account_id,
        api_id,
        path,
    })
}

/// Match a policy resource (with `*` / `?` wildcards) against a method ARN
pub fn matches_resource(pattern: &str, resource: &str) -> bool {
    if pattern == resource || pattern == "*" || pattern == "arn:aws:execute-api:**" {
        return true;
    }
    if !pattern.contains('*') && !pattern.contains('?') {
        return false;
    }

    let (Some(policy), Some(target)) = (parse_arn(pattern), parse_arn(resource)) else {
        return false;
    };

    glob_matches(policy.region, target.region)
        && glob_matches(policy.account_id, target.account_id)
        && glob_matches(policy.api_id, target.api_id)
        && glob_matches(policy.path, target.path)
}

fn glob_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" || pattern == value {
        return true;
    }
    let mut expr = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).is_ok_and(|re| re.is_match(value))
}
