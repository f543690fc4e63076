//! # Licensing Gate
//!
//! Checks the declared license of every node about to be exported against an
//! allow policy and a deny policy. The license lives in the node attribute
//! set at `source.license`; nodes without one are not checked.

use crate::primitives::{LICENSE_ATTRIBUTE_PATH, NODE_TYPE};
use crate::storage::{StoreTxn, TableSource};
use crate::types::{AttributeValue, LicenseRule, ProvarcError};
use std::collections::BTreeSet;
use std::fmt;

/// A set of licenses, or a predicate over license strings.
pub enum LicensePolicy {
    Set(BTreeSet<String>),
    Predicate(Box<dyn Fn(&str) -> bool + Send + Sync>),
}

impl LicensePolicy {
    /// A literal set policy.
    pub fn set<I, S>(licenses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Set(licenses.into_iter().map(Into::into).collect())
    }

    /// A predicate policy.
    pub fn predicate(f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Box::new(f))
    }

    /// Whether `license` is matched by the policy.
    #[must_use]
    pub fn matches(&self, license: &str) -> bool {
        match self {
            Self::Set(set) => set.contains(license),
            Self::Predicate(f) => f(license),
        }
    }
}

impl fmt::Debug for LicensePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Set(set) => f.debug_tuple("Set").field(set).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Check one license. The allow check runs before the deny check.
pub fn check_license(
    pk: u64,
    uuid: &str,
    license: &str,
    allowed: Option<&LicensePolicy>,
    forbidden: Option<&LicensePolicy>,
) -> Result<(), ProvarcError> {
    let violation = |rule| ProvarcError::LicensingViolation {
        pk,
        uuid: uuid.to_string(),
        license: license.to_string(),
        rule,
    };
    if let Some(policy) = allowed {
        if !policy.matches(license) {
            return Err(violation(LicenseRule::NotAllowed));
        }
    }
    if let Some(policy) = forbidden {
        if policy.matches(license) {
            return Err(violation(LicenseRule::Forbidden));
        }
    }
    Ok(())
}

/// Check every node in `nodes`, in id order. Reports the first violation.
pub fn check_licenses<'n, T: TableSource>(
    txn: &StoreTxn<'_, T>,
    nodes: impl IntoIterator<Item = &'n u64>,
    allowed: Option<&LicensePolicy>,
    forbidden: Option<&LicensePolicy>,
) -> Result<(), ProvarcError> {
    if allowed.is_none() && forbidden.is_none() {
        return Ok(());
    }
    for &node in nodes {
        let attributes = txn.attributes(node)?;
        let Some(AttributeValue::Text(license)) =
            AttributeValue::lookup_path(&attributes, LICENSE_ATTRIBUTE_PATH)
        else {
            continue;
        };
        let uuid = txn.unique_of(NODE_TYPE, node)?.unwrap_or_default();
        check_license(node, &uuid, license, allowed, forbidden)?;
    }
    Ok(())
}
