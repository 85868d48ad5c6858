//! Access-control model for ensemble nodes
//!
//! Mirrors the ZooKeeper ACL model: an entry grants a permission mask to an
//! identity under a scheme. The `world` scheme matches everyone, `auth`
//! matches any authenticated session, `digest` matches a presented
//! `user:password` identity.

/// Permission bits for ACL entries.
pub mod perms {
    pub const READ: u32 = 1 << 0;
    pub const WRITE: u32 = 1 << 1;
    pub const CREATE: u32 = 1 << 2;
    pub const DELETE: u32 = 1 << 3;
    pub const ADMIN: u32 = 1 << 4;
    pub const ALL: u32 = READ | WRITE | CREATE | DELETE | ADMIN;
}

/// A single access-control entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Acl {
    /// Permission mask (see [`perms`]).
    pub perms: u32,
    /// Identity scheme: `world`, `auth` or `digest`.
    pub scheme: String,
    /// Identity within the scheme.
    pub id: String,
}

impl Acl {
    /// Entry granting `perms` to everyone.
    pub fn world(perms: u32) -> Self {
        Acl {
            perms,
            scheme: "world".to_string(),
            id: "anyone".to_string(),
        }
    }

    /// Entry granting `perms` to any authenticated session.
    pub fn authenticated(perms: u32) -> Self {
        Acl {
            perms,
            scheme: "auth".to_string(),
            id: String::new(),
        }
    }

    /// Entry granting `perms` to a specific digest identity.
    pub fn digest(identity: impl Into<String>, perms: u32) -> Self {
        Acl {
            perms,
            scheme: "digest".to_string(),
            id: identity.into(),
        }
    }

    /// Whether this entry's mask covers all of `needed`.
    pub fn grants(&self, needed: u32) -> bool {
        self.perms & needed == needed
    }
}

/// Fully open ACL: everyone may do everything. Unsafe outside isolated
/// namespaces, kept for parity with shared-root deployments.
pub fn open_unsafe() -> Vec<Acl> {
    vec![Acl::world(perms::ALL)]
}

/// Everyone may read, the authenticated creator holds all permissions.
/// The default policy for discovery subtrees.
pub fn everyone_read_creator_all() -> Vec<Acl> {
    vec![Acl::world(perms::READ), Acl::authenticated(perms::ALL)]
}

/// An authentication identity presented on a session.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AuthId {
    pub scheme: String,
    pub id: String,
}

impl AuthId {
    /// Digest identity from a username and password.
    pub fn digest(user: &str, password: &str) -> Self {
        AuthId {
            scheme: "digest".to_string(),
            id: format!("{user}:{password}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grants() {
        let acl = Acl::world(perms::READ | perms::CREATE);
        assert!(acl.grants(perms::READ));
        assert!(acl.grants(perms::CREATE));
        assert!(!acl.grants(perms::DELETE));
        assert!(!acl.grants(perms::READ | perms::DELETE));
    }

    #[test]
    fn test_presets() {
        assert_eq!(open_unsafe(), vec![Acl::world(perms::ALL)]);

        let acl = everyone_read_creator_all();
        assert_eq!(acl.len(), 2);
        assert_eq!(acl[0].scheme, "world");
        assert!(acl[0].grants(perms::READ));
        assert_eq!(acl[1].scheme, "auth");
        assert!(acl[1].grants(perms::ALL));
    }

    #[test]
    fn test_digest_auth_id() {
        let auth = AuthId::digest("test", "user");
        assert_eq!(auth.scheme, "digest");
        assert_eq!(auth.id, "test:user");
    }
}
