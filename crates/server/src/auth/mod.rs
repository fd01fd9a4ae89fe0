pub mod jwt;
pub mod middleware;
pub mod password;

use corral_common::types::Role;

/// Authenticated caller, passed explicitly to allocator operations.
/// Permission predicates are pure functions of `(principal, lease owner)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: i64,
    /// Human handle; doubles as the OS user name created on workers.
    pub handle: String,
    pub role: Role,
}

impl Principal {
    /// Whether this principal may release or extend a lease owned by
    /// `owner_id`: the owner themselves, or an admin.
    pub fn may_manage_lease(&self, owner_id: i64) -> bool {
        self.role.is_admin() || self.id == owner_id
    }

    /// Whether this principal may read the cleartext secret of a lease
    /// owned by `owner_id`. Owner only; secrets are not admin-readable.
    pub fn may_read_secret(&self, owner_id: i64) -> bool {
        self.id == owner_id
    }
}

#[cfg(test)]
mod tests {
    use super::Principal;
    use corral_common::types::Role;

    fn tenant(id: i64) -> Principal {
        Principal { id, handle: format!("tenant{id}"), role: Role::Tenant }
    }

    #[test]
    fn owner_and_admin_may_manage_a_lease() {
        let owner = tenant(1);
        let stranger = tenant(2);
        let admin = Principal { id: 3, handle: "ops".into(), role: Role::Admin };

        assert!(owner.may_manage_lease(1));
        assert!(!stranger.may_manage_lease(1));
        assert!(admin.may_manage_lease(1));
    }

    #[test]
    fn only_the_owner_may_read_the_secret() {
        let owner = tenant(1);
        let admin = Principal { id: 3, handle: "ops".into(), role: Role::Admin };

        assert!(owner.may_read_secret(1));
        assert!(!admin.may_read_secret(1));
    }
}
