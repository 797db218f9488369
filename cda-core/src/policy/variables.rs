//! `${namespace:path}` policy-variable substitution (§4.7).

use crate::error::PolicyError;
use crate::session::{AttributeNamespace, Session};
use std::collections::HashSet;

/// Substitutes every `${namespace:path}` occurrence in `template` that
/// is also listed in `declared` with its value from `session`.
/// Occurrences not listed in `declared` are left as literal text.
/// A listed variable with no value fails the whole substitution.
pub fn substitute(
    template: &str,
    declared: &HashSet<(String, String)>,
    session: &Session,
) -> Result<String, PolicyError> {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        let (before, after_marker) = rest.split_at(start);
        result.push_str(before);
        let after_marker = &after_marker[2..];

        let Some(end) = after_marker.find('}') else {
            result.push_str("${");
            rest = after_marker;
            continue;
        };
        let body = &after_marker[..end];
        rest = &after_marker[end + 1..];

        let Some((namespace, path)) = body.split_once(':') else {
            result.push_str("${");
            result.push_str(body);
            result.push('}');
            continue;
        };

        if !declared.contains(&(namespace.to_string(), path.to_string())) {
            result.push_str("${");
            result.push_str(body);
            result.push('}');
            continue;
        }

        let Some((parsed_namespace, attribute)) = resolve_namespace_and_attribute(namespace, path) else {
            return Err(PolicyError::UnresolvedVariable {
                namespace: namespace.to_string(),
                path: path.to_string(),
            });
        };

        match session.get_attribute(parsed_namespace, &attribute) {
            Some(value) => result.push_str(value),
            None => {
                return Err(PolicyError::UnresolvedVariable {
                    namespace: namespace.to_string(),
                    path: path.to_string(),
                })
            }
        }
    }
    result.push_str(rest);
    Ok(result)
}

/// Resolves a variable's `(namespace, path)` token into the
/// `(AttributeNamespace, attribute)` pair a `Session` actually stores.
///
/// The wire form this spec documents is `${iot:Connection.<Namespace>.
/// <Attribute>}` (e.g. `${iot:Connection.Thing.ThingName}`): the
/// namespace is always the literal `iot`, and the real namespace and
/// attribute are both folded into the path. A bare `Thing`/
/// `Certificate`/`Component` namespace with the attribute as the path
/// is also accepted directly.
fn resolve_namespace_and_attribute(namespace: &str, path: &str) -> Option<(AttributeNamespace, String)> {
    if namespace == "iot" {
        let rest = path.strip_prefix("Connection.")?;
        let (inner_namespace, attribute) = rest.split_once('.')?;
        let parsed = AttributeNamespace::parse(inner_namespace)?;
        Some((parsed, attribute.to_string()))
    } else {
        let parsed = AttributeNamespace::parse(namespace)?;
        Some((parsed, path.to_string()))
    }
}
