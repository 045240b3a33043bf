use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{GrantError, PolicyParseError};

/// A trust proof that was validated for a request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthMethod {
    Certificate,
    Token,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuthMethod::Certificate => "CERTIFICATE",
            AuthMethod::Token => "TOKEN",
        })
    }
}

/// Which proofs a route demands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequiredMethods {
    AnyOf,
    CertificateOnly,
    TokenOnly,
    None,
}

impl RequiredMethods {
    /// Set-membership test. Holding both proofs satisfies every policy.
    pub fn is_satisfied_by(self, methods: &HashSet<AuthMethod>) -> bool {
        match self {
            RequiredMethods::AnyOf => !methods.is_empty(),
            RequiredMethods::CertificateOnly => methods.contains(&AuthMethod::Certificate),
            RequiredMethods::TokenOnly => methods.contains(&AuthMethod::Token),
            RequiredMethods::None => true,
        }
    }
}

impl FromStr for RequiredMethods {
    type Err = PolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any" | "any_of" => Ok(RequiredMethods::AnyOf),
            "certificate" | "certificate_only" => Ok(RequiredMethods::CertificateOnly),
            "token" | "token_only" => Ok(RequiredMethods::TokenOnly),
            "none" => Ok(RequiredMethods::None),
            other => Err(PolicyParseError(other.to_string())),
        }
    }
}

/// A role a token must carry, in Keycloak's claim layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleRequirement {
    /// Looked up in `realm_access.roles`.
    Realm(String),
    /// Looked up in `resource_access.<client>.roles`.
    Client { client: String, role: String },
}

/// Scopes and roles carried by a verified token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenGrants {
    pub scopes: HashSet<String>,
    pub realm_roles: HashSet<String>,
    pub client_roles: HashMap<String, HashSet<String>>,
}

impl TokenGrants {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }

    pub fn satisfies(&self, requirement: &RoleRequirement) -> bool {
        match requirement {
            RoleRequirement::Realm(role) => self.realm_roles.contains(role),
            RoleRequirement::Client { client, role } => self
                .client_roles
                .get(client)
                .is_some_and(|roles| roles.contains(role)),
        }
    }
}

/// Static per-route authorization requirements, fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutePolicy {
    pub required: RequiredMethods,
    pub required_scope: Option<String>,
    #[serde(default)]
    pub required_roles: Vec<RoleRequirement>,
}

impl RoutePolicy {
    pub fn new(required: RequiredMethods) -> Self {
        Self {
            required,
            required_scope: None,
            required_roles: Vec::new(),
        }
    }

    pub fn open() -> Self {
        Self::new(RequiredMethods::None)
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.required_scope = Some(scope.into());
        self
    }

    pub fn with_role(mut self, role: RoleRequirement) -> Self {
        self.required_roles.push(role);
        self
    }

    /// Checks the token-specific requirements of this route.
    ///
    /// A token failing here contributes no `TOKEN` method even though its
    /// signature was valid.
    pub fn check_grants(&self, grants: &TokenGrants) -> Result<(), GrantError> {
        if let Some(scope) = &self.required_scope {
            if !grants.has_scope(scope) {
                return Err(GrantError::MissingScope(scope.clone()));
            }
        }
        for requirement in &self.required_roles {
            if !grants.satisfies(requirement) {
                return Err(match requirement {
                    RoleRequirement::Realm(role) => GrantError::MissingRealmRole(role.clone()),
                    RoleRequirement::Client { client, role } => GrantError::MissingClientRole {
                        client: client.clone(),
                        role: role.clone(),
                    },
                });
            }
        }
        Ok(())
    }
}

/// Identity of the caller, from whichever proofs validated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub certificate_cn: Option<String>,
    pub token_subject: Option<String>,
}

impl Principal {
    pub fn is_anonymous(&self) -> bool {
        self.certificate_cn.is_none() && self.token_subject.is_none()
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.certificate_cn, &self.token_subject) {
            (Some(cn), Some(sub)) => write!(f, "cn={cn} sub={sub}"),
            (Some(cn), None) => write!(f, "cn={cn}"),
            (None, Some(sub)) => write!(f, "sub={sub}"),
            (None, None) => f.write_str("anonymous"),
        }
    }
}

/// Outcome of evaluating one request against one route policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthDecision {
    pub principal: Principal,
    pub methods: HashSet<AuthMethod>,
    pub allowed: bool,
}

impl AuthDecision {
    pub fn evaluate(policy: &RoutePolicy, principal: Principal, methods: HashSet<AuthMethod>) -> Self {
        let allowed = policy.required.is_satisfied_by(&methods);
        Self {
            principal,
            methods,
            allowed,
        }
    }

    pub fn has(&self, method: AuthMethod) -> bool {
        self.methods.contains(&method)
    }

    /// Human readable summary of the proofs, e.g. `CERTIFICATE+TOKEN`.
    pub fn describe_methods(&self) -> String {
        let names: Vec<String> = [AuthMethod::Certificate, AuthMethod::Token]
            .iter()
            .filter(|m| self.methods.contains(*m))
            .map(ToString::to_string)
            .collect();
        if names.is_empty() {
            "NONE".to_string()
        } else {
            names.join("+")
        }
    }
}
