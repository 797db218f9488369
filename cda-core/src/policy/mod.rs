//! Rule-expression policy evaluation (§4.7).
//!
//! No teacher module parses or evaluates rule expressions; this is
//! enriched from the pack's lexer/parser-style code (recursive-descent,
//! token-offset error reporting) and generalized to the grammar this
//! spec defines.

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod variables;

use crate::error::PolicyError;
use crate::session::{AttributeNamespace, Session};
use ast::{colon_segment_match, RuleExpr};
use std::collections::HashSet;

/// One `{operation, resource}` grant, with the policy variables the
/// resource pattern is allowed to reference (§3, §4.7).
#[derive(Debug, Clone)]
pub struct Permission {
    pub operation: String,
    pub resource: String,
    pub resource_policy_variables: HashSet<(String, String)>,
}

impl Permission {
    pub fn new(operation: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            resource: resource.into(),
            resource_policy_variables: HashSet::new(),
        }
    }

    pub fn with_variable(mut self, namespace: impl Into<String>, path: impl Into<String>) -> Self {
        self.resource_policy_variables.insert((namespace.into(), path.into()));
        self
    }
}

/// A named policy: a set of principal rule expressions (the policy is
/// applicable iff any one matches the session) and the permissions it
/// grants when applicable (§3).
pub struct Policy {
    pub name: String,
    pub principal_rules: Vec<RuleExpr>,
    pub permissions: Vec<Permission>,
}

impl Policy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            principal_rules: Vec::new(),
            permissions: Vec::new(),
        }
    }

    /// Parses and adds a principal rule expression.
    pub fn with_principal_rule(mut self, rule_expression: &str) -> Result<Self, PolicyError> {
        self.principal_rules.push(parser::parse(rule_expression)?);
        Ok(self)
    }

    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permissions.push(permission);
        self
    }

    fn is_applicable(&self, session: &Session) -> bool {
        let Some(thing_name) = session.get_attribute(AttributeNamespace::Thing, "ThingName") else {
            return false;
        };
        self.principal_rules.iter().any(|rule| rule.matches(thing_name))
    }
}

/// Evaluates `(operation, resource)` authorization requests against a
/// fixed set of policies (§4.7).
pub struct PolicyEvaluator {
    policies: Vec<Policy>,
}

impl PolicyEvaluator {
    pub fn new(policies: Vec<Policy>) -> Self {
        Self { policies }
    }

    /// `ALLOW` iff at least one applicable policy has a permission whose
    /// operation and resource both match the request; `DENY` otherwise.
    /// Any `PolicyError` during evaluation (e.g. an unresolved variable)
    /// is surfaced *and* treated as `DENY` -- never a silent allow.
    pub fn evaluate(&self, session: &Session, operation: &str, resource: &str) -> (bool, Option<PolicyError>) {
        for policy in &self.policies {
            if !policy.is_applicable(session) {
                continue;
            }
            for permission in &policy.permissions {
                if !colon_segment_match(&permission.operation, operation) {
                    continue;
                }
                match variables::substitute(&permission.resource, &permission.resource_policy_variables, session) {
                    Ok(resolved_resource) => {
                        if colon_segment_match(&resolved_resource, resource) {
                            return (true, None);
                        }
                    }
                    Err(err) => {
                        tracing::warn!(policy = %policy.name, error = %err, "policy variable resolution failed");
                        return (false, Some(err));
                    }
                }
            }
        }
        (false, None)
    }
}
