//! Caller identity handed to the resource services.
//!
//! Token verification happens in front of the services; by the time an
//! [`Identity`] reaches them it is trusted.  Services use it to stamp
//! authorship and to refuse cross-tenant access for project members.
//! Membership itself is stored per project and loaded with
//! `ProjectService::member_identity`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::MediaError;

/// Access level of an authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Limited to the projects they are a member of.
    User,
    Admin,
    SuperAdmin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
            Role::SuperAdmin => "super_admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = MediaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            "super_admin" => Ok(Role::SuperAdmin),
            other => Err(MediaError::invalid("role", format!("unknown role '{other}'"))),
        }
    }
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
    /// Projects a `user` is a member of.  Administrators carry none.
    #[serde(default)]
    pub projects: Vec<String>,
}

impl Identity {
    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: Role::Admin,
            projects: Vec::new(),
        }
    }

    /// A user who is a member of exactly `projects`.
    pub fn member(user_id: impl Into<String>, projects: Vec<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: Role::User,
            projects,
        }
    }

    pub fn project_user(user_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self::member(user_id, vec![project_id.into()])
    }

    /// Reject a user acting on a project they are not a member of.
    ///
    /// A foreign project is reported as missing so callers cannot discover
    /// other tenants' ids.
    pub fn authorize_project(&self, project_id: &str) -> Result<(), MediaError> {
        match self.role {
            Role::Admin | Role::SuperAdmin => Ok(()),
            Role::User if self.projects.iter().any(|p| p == project_id) => Ok(()),
            Role::User => Err(MediaError::not_found("project")),
        }
    }

    /// Only administrators manage projects themselves.
    pub fn require_admin(&self) -> Result<(), MediaError> {
        match self.role {
            Role::Admin | Role::SuperAdmin => Ok(()),
            Role::User => Err(MediaError::invalid(
                "role",
                "project management requires an administrator",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parses_wire_names() {
        assert_eq!("super_admin".parse::<Role>().unwrap(), Role::SuperAdmin);
        assert_eq!("user".parse::<Role>().unwrap(), Role::User);
        assert!("root".parse::<Role>().is_err());
        assert_eq!(Role::Admin.to_string(), "admin");
    }

    #[test]
    fn test_project_user_confined_to_own_project() {
        let user = Identity::project_user("u1", "p1");
        assert!(user.authorize_project("p1").is_ok());
        let err = user.authorize_project("p2").unwrap_err();
        assert!(matches!(err, MediaError::NotFound { .. }));
        assert!(user.require_admin().is_err());
    }

    #[test]
    fn test_member_reaches_each_of_their_projects() {
        let user = Identity::member("u1", vec!["p1".to_string(), "p2".to_string()]);
        assert!(user.authorize_project("p1").is_ok());
        assert!(user.authorize_project("p2").is_ok());
        assert!(user.authorize_project("p3").is_err());
        assert!(Identity::member("u2", Vec::new()).authorize_project("p1").is_err());
    }

    #[test]
    fn test_admin_reaches_every_project() {
        let admin = Identity::admin("a1");
        assert!(admin.authorize_project("p1").is_ok());
        assert!(admin.authorize_project("p2").is_ok());
        assert!(admin.require_admin().is_ok());
    }

    #[test]
    fn test_identity_serializes_camel_case() {
        let json = serde_json::to_value(Identity::project_user("u1", "p1")).unwrap();
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["role"], "user");
        assert_eq!(json["projects"], serde_json::json!(["p1"]));
    }
}
