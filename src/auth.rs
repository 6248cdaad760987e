//! Request principal. Identity verification is the fronting gateway's job;
//! it forwards the authenticated user as `x-user-id` / `x-user-role`.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    Staff,
    Admin,
}

impl Role {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "staff" => Some(Self::Staff),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: String,
    pub role: Role,
}

impl Principal {
    pub fn require(&self, role: Role) -> Result<(), ApiError> {
        if self.role >= role {
            Ok(())
        } else {
            Err(ApiError::Forbidden(format!(
                "requires {} role",
                match role {
                    Role::Staff => "staff",
                    Role::Admin => "admin",
                }
            )))
        }
    }
}

impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("missing principal".to_string()))?
            .to_string();
        let role = parts
            .headers
            .get("x-user-role")
            .and_then(|v| v.to_str().ok())
            .and_then(Role::parse)
            .ok_or_else(|| ApiError::Unauthorized("missing or unknown role".to_string()))?;
        Ok(Principal { user_id, role })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_satisfies_staff() {
        let p = Principal {
            user_id: "u1".into(),
            role: Role::Admin,
        };
        assert!(p.require(Role::Staff).is_ok());
        assert!(p.require(Role::Admin).is_ok());
    }

    #[test]
    fn staff_cannot_admin() {
        let p = Principal {
            user_id: "u1".into(),
            role: Role::Staff,
        };
        assert!(p.require(Role::Admin).is_err());
    }
}
