use axum::extract::FromRequestParts;
use http::request::Parts;

use crate::error::AppError;

/// Roles the upstream LTI layer puts in `x-lti-roles` after a launch.
pub const INSTRUCTOR_ROLES: [&str; 3] = ["Instructor", "Administrator", "ContentDeveloper"];

/// The caller, known to hold an instructor-equivalent role.
///
/// Launch validation happens upstream; this only reads what that layer
/// forwarded in `x-lti-user-id` and `x-lti-roles`.
#[derive(Debug, Clone, Copy)]
pub struct Instructor {
    pub user_id: i64,
}

pub fn has_instructor_role(roles: &str) -> bool {
    roles
        .split(',')
        .map(str::trim)
        // full URNs end with the short role name
        .map(|r| r.rsplit(['/', '#', ':']).next().unwrap_or(r))
        .any(|r| INSTRUCTOR_ROLES.contains(&r))
}

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Instructor {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };
        let roles = header("x-lti-roles").unwrap_or_default();
        if !has_instructor_role(&roles) {
            return Err(AppError::Forbidden);
        }
        let user_id = header("x-lti-user-id")
            .and_then(|v| v.parse().ok())
            .ok_or(AppError::Forbidden)?;
        Ok(Instructor { user_id })
    }
}
