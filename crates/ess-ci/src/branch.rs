//! Branch fallback resolution.
//!
//! Dependencies are checked out at the first branch of
//! `[current branch, change branch, default branch]` that exists in their
//! repository. Blank and duplicate entries are dropped.

/// Ordered, de-duplicated candidate branches.
pub fn candidate_branches(
    branch_name: Option<&str>,
    change_branch: Option<&str>,
    default_branch: &str,
) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::with_capacity(3);
    for name in [branch_name, change_branch, Some(default_branch)]
        .into_iter()
        .flatten()
    {
        let name = name.trim();
        if name.is_empty() || candidates.iter().any(|c| c == name) {
            continue;
        }
        candidates.push(name.to_string());
    }
    candidates
}

/// The git reference a build reports (first candidate).
pub fn resolve_git_ref(
    branch_name: Option<&str>,
    change_branch: Option<&str>,
    default_branch: &str,
) -> String {
    candidate_branches(branch_name, change_branch, default_branch)
        .into_iter()
        .next()
        .unwrap_or_else(|| default_branch.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_fallback_order() {
        let c = candidate_branches(Some("PR-42"), Some("tickets/DM-1234"), "develop");
        assert_eq!(c, vec!["PR-42", "tickets/DM-1234", "develop"]);
    }

    #[test]
    fn test_missing_entries_skipped() {
        let c = candidate_branches(None, Some("tickets/DM-1"), "develop");
        assert_eq!(c, vec!["tickets/DM-1", "develop"]);

        let c = candidate_branches(Some("  "), None, "develop");
        assert_eq!(c, vec!["develop"]);
    }

    #[test]
    fn test_duplicates_removed() {
        let c = candidate_branches(Some("develop"), Some("develop"), "develop");
        assert_eq!(c, vec!["develop"]);
    }

    #[test]
    fn test_git_ref_is_first_candidate() {
        assert_eq!(resolve_git_ref(Some("main"), None, "develop"), "main");
        assert_eq!(resolve_git_ref(None, None, "develop"), "develop");
    }
}
