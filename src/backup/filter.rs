use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::validate::validate_file_exist;
use bon::Builder;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use validator::Validate;

/// Server-internal schemas, compared case-insensitively.
pub const SYSTEM_DATABASES: [&str; 5] = [
    "information_schema",
    "mysql",
    "performance_schema",
    "sys",
    "mysql_innodb_cluster_metadata",
];

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterStats {
    pub total_found: usize,
    pub included: usize,
    pub excluded_empty: usize,
    pub excluded_by_blacklist: usize,
    pub excluded_by_system: usize,
    pub excluded_not_in_whitelist: usize,
}

impl FilterStats {
    pub fn excluded(&self) -> usize {
        self.excluded_empty
            + self.excluded_by_blacklist
            + self.excluded_by_system
            + self.excluded_not_in_whitelist
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterDecision {
    Included,
    ExcludedEmpty,
    ExcludedByBlacklist,
    ExcludedBySystem,
    ExcludedNotInWhitelist,
}

/// Case-folded rule set for one run.
#[derive(Clone, Debug, Default)]
pub struct FilterRule {
    exclude_system: bool,
    blacklist: HashSet<String>,
    whitelist: HashSet<String>,
}

impl FilterRule {
    pub fn new<B, W>(exclude_system: bool, blacklist: B, whitelist: W) -> Self
    where
        B: IntoIterator,
        B::Item: AsRef<str>,
        W: IntoIterator,
        W::Item: AsRef<str>,
    {
        Self {
            exclude_system,
            blacklist: fold_names(blacklist),
            whitelist: fold_names(whitelist),
        }
    }

    pub fn whitelist_active(&self) -> bool {
        !self.whitelist.is_empty()
    }

    /// First match wins: empty name, whitelist (exclusive when non-empty),
    /// blacklist, system schema.
    pub fn decide(&self, name: &str) -> FilterDecision {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return FilterDecision::ExcludedEmpty;
        }
        let folded = trimmed.to_lowercase();
        if self.whitelist_active() {
            return if self.whitelist.contains(&folded) {
                FilterDecision::Included
            } else {
                FilterDecision::ExcludedNotInWhitelist
            };
        }
        if self.blacklist.contains(&folded) {
            return FilterDecision::ExcludedByBlacklist;
        }
        if self.exclude_system && is_system_database(&folded) {
            return FilterDecision::ExcludedBySystem;
        }
        FilterDecision::Included
    }
}

fn fold_names<I>(names: I) -> HashSet<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    names
        .into_iter()
        .map(|n| n.as_ref().trim().to_lowercase())
        .filter(|n| !n.is_empty())
        .collect()
}

pub fn is_system_database(name: &str) -> bool {
    SYSTEM_DATABASES
        .iter()
        .any(|system| system.eq_ignore_ascii_case(name.trim()))
}

/// Applies `rule` to every name, keeping input order for the included names.
///
/// Returns `Error::NoEligibleDatabases` (carrying the stats) when nothing is left.
pub fn filter_databases<S: AsRef<str>>(
    names: &[S],
    rule: &FilterRule,
) -> Result<(Vec<String>, FilterStats)> {
    let mut stats = FilterStats {
        total_found: names.len(),
        ..FilterStats::default()
    };
    let mut included = Vec::new();

    for name in names {
        let name = name.as_ref();
        match rule.decide(name) {
            FilterDecision::Included => {
                stats.included += 1;
                included.push(name.trim().to_string());
            }
            FilterDecision::ExcludedEmpty => stats.excluded_empty += 1,
            FilterDecision::ExcludedByBlacklist => {
                tracing::debug!("Excluding blacklisted database {name:?}");
                stats.excluded_by_blacklist += 1
            }
            FilterDecision::ExcludedBySystem => {
                tracing::debug!("Excluding system database {name:?}");
                stats.excluded_by_system += 1
            }
            FilterDecision::ExcludedNotInWhitelist => stats.excluded_not_in_whitelist += 1,
        }
    }

    tracing::info!(
        "Filtered databases: {} found, {} included, {} excluded",
        stats.total_found,
        stats.included,
        stats.excluded()
    );

    if included.is_empty() {
        return Err(Error::NoEligibleDatabases(stats));
    }
    Ok((included, stats))
}

/// Reads one database name per line; blank lines and `#` comments are skipped.
pub fn read_name_list<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(Error::from)
        .with_msg(format!("Read database list failed: {path:?}"))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Validate, Builder)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    #[serde(default = "default_exclude_system")]
    #[builder(default = default_exclude_system())]
    pub exclude_system: bool,
    #[serde(default)]
    #[builder(default)]
    pub blacklist: Vec<String>,
    #[serde(default)]
    #[builder(default)]
    pub whitelist: Vec<String>,
    #[validate(custom(function = validate_file_exist))]
    pub whitelist_file: Option<PathBuf>,
}

fn default_exclude_system() -> bool {
    true
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl FilterConfig {
    /// Builds the rule, merging names from `whitelist_file` into the whitelist.
    pub fn to_rule(&self) -> Result<FilterRule> {
        let mut whitelist = self.whitelist.clone();
        if let Some(path) = &self.whitelist_file {
            whitelist.extend(read_name_list(path)?);
        }
        Ok(FilterRule::new(
            self.exclude_system,
            &self.blacklist,
            &whitelist,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn assert_stats_balance(stats: &FilterStats) {
        assert_eq!(stats.total_found, stats.included + stats.excluded());
    }

    #[test]
    fn test_system_and_empty_excluded() {
        let rule = FilterRule::new(true, Vec::<String>::new(), Vec::<String>::new());
        let input = names(&["app", "", "  ", "mysql", "SYS", "Performance_Schema", "crm"]);
        let (included, stats) = filter_databases(&input, &rule).unwrap();

        assert_eq!(included, vec!["app", "crm"]);
        assert_eq!(stats.excluded_empty, 2);
        assert_eq!(stats.excluded_by_system, 3);
        assert_stats_balance(&stats);
    }

    #[test]
    fn test_system_kept_when_not_excluded() {
        let rule = FilterRule::new(false, Vec::<String>::new(), Vec::<String>::new());
        let (included, stats) = filter_databases(&names(&["mysql", "app"]), &rule).unwrap();
        assert_eq!(included.len(), 2);
        assert_eq!(stats.excluded_by_system, 0);
    }

    #[test]
    fn test_blacklist_case_insensitive() {
        let rule = FilterRule::new(true, ["Legacy"], Vec::<String>::new());
        let (included, stats) =
            filter_databases(&names(&["legacy", "LEGACY", "shop"]), &rule).unwrap();
        assert_eq!(included, vec!["shop"]);
        assert_eq!(stats.excluded_by_blacklist, 2);
        assert_stats_balance(&stats);
    }

    #[test]
    fn test_whitelist_dominates_blacklist_and_system() {
        let rule = FilterRule::new(true, ["shop", "mysql"], ["SHOP", "mysql"]);
        let input = names(&["shop", "mysql", "crm", "", "sys"]);
        let (included, stats) = filter_databases(&input, &rule).unwrap();

        assert_eq!(included, vec!["shop", "mysql"]);
        assert_eq!(stats.excluded_not_in_whitelist, 2);
        assert_eq!(stats.excluded_by_blacklist, 0);
        assert_eq!(stats.excluded_by_system, 0);
        assert_eq!(stats.excluded_empty, 1);
        assert_stats_balance(&stats);
    }

    #[test]
    fn test_absent_from_whitelist_always_excluded() {
        let rule = FilterRule::new(false, Vec::<String>::new(), ["only_this"]);
        assert_eq!(rule.decide("other"), FilterDecision::ExcludedNotInWhitelist);
        assert_eq!(rule.decide("ONLY_THIS"), FilterDecision::Included);
    }

    #[test]
    fn test_empty_result_is_error_with_stats() {
        let rule = FilterRule::new(true, Vec::<String>::new(), Vec::<String>::new());
        match filter_databases(&names(&["mysql", "sys", ""]), &rule) {
            Err(Error::NoEligibleDatabases(stats)) => {
                assert_eq!(stats.total_found, 3);
                assert_eq!(stats.included, 0);
                assert_stats_balance(&stats);
            }
            other => panic!("unexpected {other:?}"),
        }
        let empty: Vec<String> = Vec::new();
        assert!(filter_databases(&empty, &rule).is_err());
    }

    #[test]
    fn test_stats_balance_over_mixed_inputs() {
        let rules = [
            FilterRule::new(true, ["b"], Vec::<String>::new()),
            FilterRule::new(false, ["a", "mysql"], ["a", "c"]),
            FilterRule::new(true, Vec::<String>::new(), Vec::<String>::new()),
        ];
        let inputs = [
            names(&["a", "b", "c", "mysql", "", "sys", "x"]),
            names(&["information_schema", " c ", "A"]),
        ];
        for rule in &rules {
            for input in &inputs {
                let stats = match filter_databases(input, rule) {
                    Ok((included, stats)) => {
                        assert_eq!(included.len(), stats.included);
                        stats
                    }
                    Err(Error::NoEligibleDatabases(stats)) => stats,
                    Err(e) => panic!("unexpected {e}"),
                };
                assert_eq!(stats.total_found, input.len());
                assert_stats_balance(&stats);
            }
        }
    }

    #[test]
    fn test_whitelist_file_merged() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("whitelist.txt");
        std::fs::write(&path, "# prod schemas\nbilling\n\n  crm  \n").unwrap();

        let config = FilterConfig::builder()
            .whitelist(vec!["shop".to_string()])
            .whitelist_file(path)
            .build();
        assert!(config.validate().is_ok());
        let rule = config.to_rule().unwrap();

        let (included, _) =
            filter_databases(&names(&["billing", "crm", "shop", "hr"]), &rule).unwrap();
        assert_eq!(included, vec!["billing", "crm", "shop"]);
    }

    #[test]
    fn test_filter_config_defaults() {
        let config: FilterConfig = serde_json::from_str("{}").unwrap();
        assert!(config.exclude_system);
        assert!(config.whitelist_file.is_none());
    }
}
