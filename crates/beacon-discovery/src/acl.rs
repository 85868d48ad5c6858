//! ACL policy for the discovery subtree
//!
//! Access control is uniform across the whole subtree by design: one
//! configured list answers both the default ACL and every per-path query.

use beacon_common::{DiscoveryError, Result};
use beacon_ensemble::Acl;

/// Produces the ACL applied to every node this subsystem creates.
pub trait AclPolicy: Send + Sync {
    fn default_acl(&self) -> &[Acl];

    fn acl_for_path(&self, path: &str) -> &[Acl];
}

/// An [`AclPolicy`] that hands back the same list for every query.
#[derive(Debug)]
pub struct SingleAclPolicy {
    acl: Vec<Acl>,
}

impl SingleAclPolicy {
    /// Fails fast on an empty list: zero entries would leave nodes with no
    /// defined access, which is rejected outright rather than treated as
    /// open.
    pub fn new(acl: Vec<Acl>) -> Result<Self> {
        if acl.is_empty() {
            return Err(DiscoveryError::IllegalArgument(
                "ACL list must not be empty".to_string(),
            ));
        }
        Ok(SingleAclPolicy { acl })
    }
}

impl AclPolicy for SingleAclPolicy {
    fn default_acl(&self) -> &[Acl] {
        &self.acl
    }

    fn acl_for_path(&self, _path: &str) -> &[Acl] {
        &self.acl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_ensemble::acl::everyone_read_creator_all;

    #[test]
    fn test_single_acl_policy_uniformity() {
        let acl = everyone_read_creator_all();
        let policy = SingleAclPolicy::new(acl.clone()).unwrap();

        assert_eq!(policy.default_acl(), acl.as_slice());
        assert_eq!(policy.acl_for_path("/random/path/1"), acl.as_slice());
        assert_eq!(policy.acl_for_path("/random/path/2"), acl.as_slice());
    }

    #[test]
    fn test_single_acl_policy_empty() {
        let err = SingleAclPolicy::new(Vec::new()).unwrap_err();
        assert!(matches!(err, DiscoveryError::IllegalArgument(_)));
    }
}
