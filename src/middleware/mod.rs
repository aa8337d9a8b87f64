pub mod auth;

pub use auth::{
    require_auth, require_role, AuthenticatedUser, AUDIT_VIEW_ROLES, ITEM_DELETE_ROLES,
    ITEM_WRITE_ROLES,
};
