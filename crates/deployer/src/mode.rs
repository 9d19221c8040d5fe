//! Deployment mode selection.
//!
//! A pure function of the operator flags, the configured groups, the scan
//! result and the partial-validity policy.

use serde::{Deserialize, Serialize};

use certshift_common::{DeploymentMode, DomainGroup, PartialPolicy};

use crate::error::AcquisitionError;
use crate::store::ScanResult;

/// Operator override of availability inference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForceFlag {
    #[default]
    None,
    /// `--force-http`
    Http,
    /// `--force-ssl`
    Https,
}

/// The mode decision handed to the config switcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModePlan {
    pub mode: DeploymentMode,
    pub encrypted_groups: Vec<String>,
    pub plaintext_groups: Vec<String>,
    pub reason: String,
}

impl ModePlan {
    /// Every group is served encrypted
    pub fn is_fully_encrypted(&self) -> bool {
        self.mode.is_encrypted() && self.plaintext_groups.is_empty()
    }

    fn plaintext(mode: DeploymentMode, groups: &[DomainGroup], reason: impl Into<String>) -> Self {
        Self {
            mode,
            encrypted_groups: Vec::new(),
            plaintext_groups: groups.iter().map(|g| g.name.clone()).collect(),
            reason: reason.into(),
        }
    }
}

/// Choose the deployment mode.
///
/// `ForceFlag::Https` with any required group lacking a valid bundle fails
/// with [`AcquisitionError::Precondition`] before anything is mutated.
pub fn decide(
    flag: ForceFlag,
    groups: &[DomainGroup],
    statuses: &ScanResult,
    policy: PartialPolicy,
) -> Result<ModePlan, AcquisitionError> {
    let is_valid = |g: &DomainGroup| statuses.get(&g.name).is_some_and(|s| s.is_valid());

    if flag == ForceFlag::Http {
        return Ok(ModePlan::plaintext(
            DeploymentMode::ForcedHttp,
            groups,
            "plaintext forced by operator",
        ));
    }

    let invalid_required: Vec<String> = groups
        .iter()
        .filter(|g| g.required && !is_valid(g))
        .map(|g| g.name.clone())
        .collect();

    let (valid, invalid): (Vec<&DomainGroup>, Vec<&DomainGroup>) =
        groups.iter().partition(|g| is_valid(g));
    let names = |gs: &[&DomainGroup]| gs.iter().map(|g| g.name.clone()).collect::<Vec<_>>();

    if flag == ForceFlag::Https {
        if !invalid_required.is_empty() {
            return Err(AcquisitionError::Precondition {
                groups: invalid_required,
            });
        }
        return Ok(ModePlan {
            mode: DeploymentMode::ForcedHttps,
            encrypted_groups: names(&valid),
            plaintext_groups: names(&invalid),
            reason: "encryption forced by operator".to_string(),
        });
    }

    if invalid_required.is_empty() && !valid.is_empty() {
        return Ok(ModePlan {
            mode: DeploymentMode::Https,
            encrypted_groups: names(&valid),
            plaintext_groups: names(&invalid),
            reason: "all required groups have valid certificates".to_string(),
        });
    }

    match policy {
        PartialPolicy::ValidSubset if !valid.is_empty() => Ok(ModePlan {
            mode: DeploymentMode::Https,
            encrypted_groups: names(&valid),
            plaintext_groups: names(&invalid),
            reason: format!(
                "encrypting valid subset; without valid certificates: {}",
                invalid_required.join(", ")
            ),
        }),
        _ if valid.is_empty() => Ok(ModePlan::plaintext(
            DeploymentMode::HttpOnly,
            groups,
            "no valid certificates",
        )),
        _ => Ok(ModePlan::plaintext(
            DeploymentMode::HttpOnly,
            groups,
            format!(
                "required groups without valid certificates: {}",
                invalid_required.join(", ")
            ),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::store::{BundleStatus, CertificateBundle};
    use chrono::Utc;
    use proptest::prelude::*;

    fn valid_status(group: &str) -> BundleStatus {
        let now = Utc::now();
        BundleStatus::Valid {
            days_remaining: 60,
            bundle: Box::new(CertificateBundle {
                group: group.to_string(),
                fullchain_pem: String::new(),
                chain_pem: String::new(),
                key_pem: String::new(),
                issuer: "CN=test".to_string(),
                not_before: now,
                not_after: now + chrono::Duration::days(60),
                subject_names: vec![],
                fingerprint: String::new(),
            }),
        }
    }

    fn missing() -> BundleStatus {
        BundleStatus::Missing {
            artifacts: vec!["fullchain.pem".to_string()],
        }
    }

    fn setup(valid: &[bool], required: &[bool]) -> (Vec<DomainGroup>, ScanResult) {
        let mut groups = Vec::new();
        let mut statuses = ScanResult::new();
        for (i, (&v, &r)) in valid.iter().zip(required).enumerate() {
            let name = format!("g{}", i);
            let mut group = DomainGroup::new(&name, vec![format!("{}.example.com", name)]);
            group.required = r;
            statuses.insert(name.clone(), if v { valid_status(&name) } else { missing() });
            groups.push(group);
        }
        (groups, statuses)
    }

    #[test]
    fn test_all_valid_is_https() {
        let (groups, statuses) = setup(&[true, true], &[true, true]);
        let plan = decide(ForceFlag::None, &groups, &statuses, PartialPolicy::default()).unwrap();
        assert_eq!(plan.mode, DeploymentMode::Https);
        assert!(plan.is_fully_encrypted());
    }

    #[test]
    fn test_none_valid_is_http_only() {
        let (groups, statuses) = setup(&[false, false], &[true, true]);
        let plan = decide(ForceFlag::None, &groups, &statuses, PartialPolicy::default()).unwrap();
        assert_eq!(plan.mode, DeploymentMode::HttpOnly);
        assert_eq!(plan.plaintext_groups.len(), 2);
        assert_eq!(plan.reason, "no valid certificates");
    }

    #[test]
    fn test_partial_all_or_nothing() {
        let (groups, statuses) = setup(&[true, false], &[true, true]);
        let plan =
            decide(ForceFlag::None, &groups, &statuses, PartialPolicy::AllOrNothing).unwrap();
        assert_eq!(plan.mode, DeploymentMode::HttpOnly);
        assert!(plan.encrypted_groups.is_empty());
        assert!(plan.reason.contains("g1"));
    }

    #[test]
    fn test_partial_valid_subset() {
        let (groups, statuses) = setup(&[true, false], &[true, true]);
        let plan = decide(ForceFlag::None, &groups, &statuses, PartialPolicy::ValidSubset).unwrap();
        assert_eq!(plan.mode, DeploymentMode::Https);
        assert_eq!(plan.encrypted_groups, vec!["g0"]);
        assert_eq!(plan.plaintext_groups, vec!["g1"]);
        assert!(!plan.is_fully_encrypted());
    }

    #[test]
    fn test_optional_group_never_blocks() {
        let (groups, statuses) = setup(&[true, false], &[true, false]);
        let plan =
            decide(ForceFlag::None, &groups, &statuses, PartialPolicy::AllOrNothing).unwrap();
        assert_eq!(plan.mode, DeploymentMode::Https);
        assert_eq!(plan.plaintext_groups, vec!["g1"]);
    }

    #[test]
    fn test_force_http() {
        let (groups, statuses) = setup(&[true, true], &[true, true]);
        let plan = decide(ForceFlag::Http, &groups, &statuses, PartialPolicy::default()).unwrap();
        assert_eq!(plan.mode, DeploymentMode::ForcedHttp);
        assert!(plan.encrypted_groups.is_empty());
    }

    #[test]
    fn test_force_https_requires_validity() {
        let (groups, mut statuses) = setup(&[true, false], &[true, true]);
        statuses.insert(
            "g0".to_string(),
            BundleStatus::Invalid {
                reason: ValidationError::KeyMismatch,
            },
        );

        match decide(ForceFlag::Https, &groups, &statuses, PartialPolicy::ValidSubset) {
            Err(AcquisitionError::Precondition { groups }) => {
                assert_eq!(groups, vec!["g0", "g1"])
            }
            other => panic!("expected precondition error, got {:?}", other),
        }
    }

    #[test]
    fn test_force_https_all_valid() {
        let (groups, statuses) = setup(&[true], &[true]);
        let plan = decide(ForceFlag::Https, &groups, &statuses, PartialPolicy::default()).unwrap();
        assert_eq!(plan.mode, DeploymentMode::ForcedHttps);
    }

    #[test]
    fn test_unscanned_group_counts_as_invalid() {
        let (groups, _) = setup(&[true], &[true]);
        let plan = decide(
            ForceFlag::None,
            &groups,
            &ScanResult::new(),
            PartialPolicy::default(),
        )
        .unwrap();
        assert_eq!(plan.mode, DeploymentMode::HttpOnly);
    }

    proptest! {
        #[test]
        fn prop_encrypted_groups_are_valid(
            layout in proptest::collection::vec((any::<bool>(), any::<bool>()), 1..8),
            subset in any::<bool>(),
        ) {
            let valid: Vec<bool> = layout.iter().map(|(v, _)| *v).collect();
            let required: Vec<bool> = layout.iter().map(|(_, r)| *r).collect();
            let (groups, statuses) = setup(&valid, &required);
            let policy = if subset { PartialPolicy::ValidSubset } else { PartialPolicy::AllOrNothing };

            let plan = decide(ForceFlag::None, &groups, &statuses, policy).unwrap();

            // Partition of the configured groups
            prop_assert_eq!(plan.encrypted_groups.len() + plan.plaintext_groups.len(), groups.len());
            for name in &plan.encrypted_groups {
                prop_assert!(statuses[name].is_valid());
            }

            let all_required_valid = groups.iter().all(|g| !g.required || statuses[&g.name].is_valid());
            if plan.mode.is_encrypted() && !subset {
                prop_assert!(all_required_valid);
            }
            if !plan.mode.is_encrypted() {
                prop_assert!(plan.encrypted_groups.is_empty());
            }
        }

        #[test]
        fn prop_force_https_never_encrypts_invalid(
            layout in proptest::collection::vec((any::<bool>(), any::<bool>()), 1..8),
        ) {
            let valid: Vec<bool> = layout.iter().map(|(v, _)| *v).collect();
            let required: Vec<bool> = layout.iter().map(|(_, r)| *r).collect();
            let (groups, statuses) = setup(&valid, &required);

            match decide(ForceFlag::Https, &groups, &statuses, PartialPolicy::ValidSubset) {
                Ok(plan) => {
                    prop_assert_eq!(plan.mode, DeploymentMode::ForcedHttps);
                    for g in groups.iter().filter(|g| g.required) {
                        prop_assert!(plan.encrypted_groups.contains(&g.name));
                    }
                }
                Err(AcquisitionError::Precondition { groups: invalid }) => {
                    prop_assert!(!invalid.is_empty());
                }
                Err(e) => prop_assert!(false, "unexpected error {}", e),
            }
        }
    }
}
