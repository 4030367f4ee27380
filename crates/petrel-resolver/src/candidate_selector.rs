use std::collections::BTreeSet;

use petrel_spec::{Version, VersionSpecifiers};

use crate::provider::Candidate;

/// Newest-first candidate selection against an accumulated constraint set.
pub(crate) struct CandidateSelector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllowPreRelease {
    Yes,
    IfNecessary,
}

impl CandidateSelector {
    /// Select the newest candidate admitted by every constraint, skipping
    /// rejected versions.
    ///
    /// Pre-releases are considered only when some constraint itself
    /// mentions one, or as a fallback when the package has no final
    /// releases at all.
    pub(crate) fn select<'a>(
        candidates: &'a [Candidate],
        constraints: &[&VersionSpecifiers],
        rejected: Option<&BTreeSet<Version>>,
    ) -> Option<&'a Candidate> {
        let allow_prerelease = if constraints
            .iter()
            .any(|specifiers| specifiers.any_prerelease())
        {
            AllowPreRelease::Yes
        } else {
            AllowPreRelease::IfNecessary
        };

        let mut fallback = None;
        let mut saw_final = false;
        for candidate in candidates {
            if rejected.is_some_and(|rejected| rejected.contains(&candidate.version)) {
                continue;
            }
            let admitted = constraints
                .iter()
                .all(|specifiers| specifiers.contains(&candidate.version));
            if candidate.version.any_prerelease() {
                if admitted {
                    match allow_prerelease {
                        AllowPreRelease::Yes => return Some(candidate),
                        AllowPreRelease::IfNecessary => {
                            if fallback.is_none() {
                                fallback = Some(candidate);
                            }
                        }
                    }
                }
            } else {
                // Any final release, matching or not, rules out the
                // pre-release fallback.
                saw_final = true;
                if admitted {
                    return Some(candidate);
                }
            }
        }
        if saw_final {
            None
        } else {
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use petrel_normalize::PackageName;

    use super::*;

    fn candidate(version: &str) -> Candidate {
        Candidate::new(
            PackageName::new("pkg").unwrap(),
            Version::from_str(version).unwrap(),
        )
    }

    fn specifiers(input: &str) -> VersionSpecifiers {
        VersionSpecifiers::from_str(input).unwrap()
    }

    #[test]
    fn newest_admitted_wins() {
        let candidates = vec![candidate("2.0"), candidate("1.5"), candidate("1.0")];
        let constraints = specifiers("<2.0");
        let selected =
            CandidateSelector::select(&candidates, &[&constraints], None).unwrap();
        assert_eq!(selected.version, Version::from_str("1.5").unwrap());
    }

    #[test]
    fn rejected_versions_are_skipped() {
        let candidates = vec![candidate("2.0"), candidate("1.5"), candidate("1.0")];
        let constraints = specifiers("*");
        let rejected = [Version::from_str("2.0").unwrap()].into_iter().collect();
        let selected =
            CandidateSelector::select(&candidates, &[&constraints], Some(&rejected)).unwrap();
        assert_eq!(selected.version, Version::from_str("1.5").unwrap());
    }

    #[test]
    fn prereleases_need_an_invitation() {
        let candidates = vec![candidate("2.0rc1"), candidate("1.0")];
        let constraints = specifiers(">=1.0");
        let selected =
            CandidateSelector::select(&candidates, &[&constraints], None).unwrap();
        assert_eq!(selected.version, Version::from_str("1.0").unwrap());

        let constraints = specifiers(">=2.0rc1");
        let selected =
            CandidateSelector::select(&candidates, &[&constraints], None).unwrap();
        assert_eq!(selected.version, Version::from_str("2.0rc1").unwrap());
    }

    #[test]
    fn prerelease_fallback_when_nothing_final_exists() {
        let candidates = vec![candidate("1.0b2"), candidate("1.0b1")];
        let constraints = specifiers("*");
        let selected =
            CandidateSelector::select(&candidates, &[&constraints], None).unwrap();
        assert_eq!(selected.version, Version::from_str("1.0b2").unwrap());
    }

    #[test]
    fn intersection_of_constraints() {
        let candidates = vec![candidate("2.0"), candidate("1.5"), candidate("1.0")];
        let lower = specifiers(">=1.2");
        let upper = specifiers("<2.0");
        let selected =
            CandidateSelector::select(&candidates, &[&lower, &upper], None).unwrap();
        assert_eq!(selected.version, Version::from_str("1.5").unwrap());
    }
}
