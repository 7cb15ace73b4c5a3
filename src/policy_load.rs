//! Rule ingestion from CSV files
//!
//! The loader reads the lexically latest `*.csv` in the policy directory
//! (filenames carry timestamps, so lexical order is recency order), compiles
//! the per-rule predicates and installs the result atomically.
//!
//! Operator notes on safe defaults:
//! - a rule whose CIDR columns are empty (or whose every block failed to
//!   parse) matches NO traffic; membership over an empty list is false
//! - a number column that fails to compile turns into a never-matching
//!   predicate, disabling just that rule
//! - rows shorter than the required column count are skipped silently
//!
//! Two column layouts exist. Legacy (11 columns before the target):
//! `id;state;priority;description;numA;numB;numC;period_start;period_stop;src_cidrs;sbc_cidrs;target…`
//! Extended inserts `src_type;require_sim_a;require_sim_b;operator_b` before
//! the target. The header row decides which layout a file uses.
//!
//! Targets may embed `;`, so everything after the fixed columns is re-joined.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use ipnet::IpNet;
use regex::Regex;
use tracing::{info, warn};

use crate::error::{GoMobileError, GoMobileResult};
use crate::policy::{NumberPattern, PolicyRepository, Rule};

/// Columns before the target in the legacy layout
const LEGACY_COLUMNS: usize = 11;
/// Columns before the target in the extended layout
const EXTENDED_COLUMNS: usize = 15;

pub struct PolicyLoader {
    repo: Arc<PolicyRepository>,
}

impl PolicyLoader {
    pub fn new(repo: Arc<PolicyRepository>) -> Self {
        PolicyLoader { repo }
    }

    /// Load the newest rule file from `dir` and install it.
    ///
    /// The directory is created when absent; an empty directory is a load
    /// error (fatal at startup).
    pub fn load_latest_from_dir(&self, dir: &str) -> GoMobileResult<()> {
        let latest = latest_file_in_dir(dir, "csv")?;
        let content = std::fs::read_to_string(&latest)
            .map_err(|e| GoMobileError::load_error(latest.display().to_string(), e.to_string()))?;

        let rules = parse_rules_csv(&content);
        let version = latest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!("loaded {} policies from {}", rules.len(), latest.display());
        self.repo.set_rules(rules, version);
        Ok(())
    }
}

/// Parse the CSV body into rules. Never fails as a whole; bad records
/// degrade per the module docs.
pub fn parse_rules_csv(content: &str) -> Vec<Rule> {
    let mut lines = content.lines();

    // The header row is skipped, but its width picks the layout.
    let fixed_columns = match lines.next() {
        Some(header) if header.split(';').count() >= EXTENDED_COLUMNS => EXTENDED_COLUMNS,
        Some(_) => LEGACY_COLUMNS,
        None => return Vec::new(),
    };

    let mut rules = Vec::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(';').collect();
        if fields.len() < fixed_columns {
            continue;
        }

        let id = fields[0].trim().parse::<i64>().unwrap_or(0);
        let state = fields[1].trim().parse::<i64>().unwrap_or(0);
        let priority = fields[2].trim().parse::<i64>().unwrap_or(0);
        let description = fields[3].to_string();

        let num_a = compile_pattern(fields[4], id, "num_a");
        let num_b = compile_pattern(fields[5], id, "num_b");
        let num_c = compile_pattern(fields[6], id, "num_c");

        let period_start = fields[7].trim().parse::<i64>().unwrap_or(0);
        let period_stop = fields[8].trim().parse::<i64>().unwrap_or(0);

        let src_cidrs = parse_ip_ranges(fields[9]);
        let sbc_cidrs = parse_ip_ranges(fields[10]);

        let (src_type, require_sim_a, require_sim_b, operator_b) =
            if fixed_columns == EXTENDED_COLUMNS {
                (
                    fields[11].to_string(),
                    parse_tri_state(fields[12]),
                    parse_tri_state(fields[13]),
                    fields[14].to_string(),
                )
            } else {
                (String::new(), None, None, String::new())
            };

        let target = if fields.len() > fixed_columns {
            fields[fixed_columns..].join(";")
        } else {
            String::new()
        };

        rules.push(Rule {
            id,
            state,
            priority,
            description,
            num_a,
            num_b,
            num_c,
            period_start,
            period_stop,
            src_cidrs,
            sbc_cidrs,
            target,
            src_type,
            require_sim_a,
            require_sim_b,
            operator_b,
            match_counter: AtomicU64::new(0),
        });
    }
    rules
}

fn compile_pattern(pattern: &str, rule_id: i64, column: &str) -> NumberPattern {
    match Regex::new(pattern) {
        Ok(re) => NumberPattern::compiled(re),
        Err(e) => {
            warn!(
                "rule {}: invalid {} regex '{}': {}; rule will not match",
                rule_id, column, pattern, e
            );
            NumberPattern::never()
        }
    }
}

/// Parse a pipe-separated CIDR column; a bare IP gets `/32` appended
fn parse_ip_ranges(field: &str) -> Vec<IpNet> {
    let mut ranges = Vec::new();
    for block in field.split('|') {
        let block = block.trim();
        if block.is_empty() {
            continue;
        }
        let cidr = if block.contains('/') {
            block.to_string()
        } else {
            format!("{}/32", block)
        };
        match cidr.parse::<IpNet>() {
            Ok(net) => ranges.push(net),
            Err(e) => warn!("invalid CIDR '{}': {}", cidr, e),
        }
    }
    ranges
}

/// Tri-state SIM requirement: empty is unset, otherwise non-zero means set
fn parse_tri_state(field: &str) -> Option<bool> {
    let field = field.trim();
    if field.is_empty() {
        return None;
    }
    Some(field.parse::<i64>().unwrap_or(0) != 0)
}

/// Pick the lexically latest `*.<ext>` file in `dir`.
///
/// Shared by the rule and FNM loaders: both follow the newest-file-wins
/// discipline. The directory is created (`0755`) when missing.
pub(crate) fn latest_file_in_dir(dir: &str, ext: &str) -> GoMobileResult<PathBuf> {
    let dir_path = Path::new(dir);
    if !dir_path.is_dir() {
        std::fs::create_dir_all(dir_path)
            .map_err(|e| GoMobileError::load_error(dir, e.to_string()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(dir_path, std::fs::Permissions::from_mode(0o755));
        }
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(dir_path)
        .map_err(|e| GoMobileError::load_error(dir, e.to_string()))?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file() && path.extension().map(|e| e == ext).unwrap_or(false)
        })
        .collect();

    if files.is_empty() {
        return Err(GoMobileError::load_error(
            dir,
            format!("no {} files found", ext),
        ));
    }
    files.sort();
    Ok(files.pop().expect("non-empty file list"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER_EXT: &str =
        "id;state;priority;description;num_a;num_b;num_c;period_start;period_stop;src;sbc;src_type;require_sim_a;require_sim_b;operator_b;target";
    const HEADER_LEGACY: &str =
        "id;state;priority;description;num_a;num_b;num_c;period_start;period_stop;src;sbc;target";

    #[test]
    fn test_parse_extended_row() {
        let csv = format!(
            "{}\n1;0;10;test rule;^555$;^777$;.*;0;99999999999;10.0.0.0/24;10.0.0.0/24;mvno;1;0;beeline;sip:%b%@10.0.0.5",
            HEADER_EXT
        );
        let rules = parse_rules_csv(&csv);
        assert_eq!(rules.len(), 1);
        let r = &rules[0];
        assert_eq!(r.id, 1);
        assert_eq!(r.priority, 10);
        assert_eq!(r.src_type, "mvno");
        assert_eq!(r.require_sim_a, Some(true));
        assert_eq!(r.require_sim_b, Some(false));
        assert_eq!(r.operator_b, "beeline");
        assert_eq!(r.target, "sip:%b%@10.0.0.5");
        assert!(r.num_a.matches("555"));
        assert!(!r.num_a.matches("556"));
    }

    #[test]
    fn test_parse_legacy_row() {
        let csv = format!(
            "{}\n2;0;5;legacy;^1.*;.*;.*;0;99999999999;192.0.2.0/25;192.0.2.0/25;sip:%a%@pbx",
            HEADER_LEGACY
        );
        let rules = parse_rules_csv(&csv);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].target, "sip:%a%@pbx");
        assert_eq!(rules[0].src_type, "");
        assert_eq!(rules[0].require_sim_a, None);
    }

    #[test]
    fn test_target_preserves_embedded_delimiter() {
        let csv = format!(
            "{}\n3;0;5;d;.*;.*;.*;0;99999999999;10.0.0.0/24;10.0.0.0/24;;;;;sip:x@h;user=phone",
            HEADER_EXT
        );
        let rules = parse_rules_csv(&csv);
        assert_eq!(rules[0].target, "sip:x@h;user=phone");
    }

    #[test]
    fn test_short_rows_skipped() {
        let csv = format!("{}\n1;2;3\n\n4;5;6;7\n", HEADER_EXT);
        assert!(parse_rules_csv(&csv).is_empty());
    }

    #[test]
    fn test_bad_regex_becomes_inert() {
        let csv = format!(
            "{}\n4;0;5;d;[broken;.*;.*;0;99999999999;10.0.0.0/24;10.0.0.0/24;target",
            HEADER_LEGACY
        );
        let rules = parse_rules_csv(&csv);
        assert_eq!(rules.len(), 1);
        assert!(!rules[0].num_a.matches("anything"));
        assert!(rules[0].num_b.matches("x"));
    }

    #[test]
    fn test_bare_ip_gets_host_prefix() {
        let ranges = parse_ip_ranges("10.0.0.1|192.0.2.0/25");
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].to_string(), "10.0.0.1/32");
        assert!(ranges[0].contains(&"10.0.0.1".parse::<std::net::IpAddr>().unwrap()));
        assert!(!ranges[0].contains(&"10.0.0.2".parse::<std::net::IpAddr>().unwrap()));
    }

    #[test]
    fn test_invalid_cidr_skipped() {
        let ranges = parse_ip_ranges("not-a-cidr|10.0.0.0/24");
        assert_eq!(ranges.len(), 1);
    }

    #[test]
    fn test_latest_file_selection() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["20250101.csv", "20250301.csv", "20250201.csv", "notes.txt"] {
            std::fs::write(dir.path().join(name), "x").unwrap();
        }
        let latest = latest_file_in_dir(dir.path().to_str().unwrap(), "csv").unwrap();
        assert_eq!(latest.file_name().unwrap(), "20250301.csv");
    }

    #[test]
    fn test_empty_dir_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = latest_file_in_dir(dir.path().to_str().unwrap(), "csv").unwrap_err();
        assert_eq!(err.category(), "load");
    }

    #[test]
    fn test_missing_dir_created() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("fresh");
        let err = latest_file_in_dir(sub.to_str().unwrap(), "csv");
        assert!(err.is_err());
        assert!(sub.is_dir());
    }

    #[test]
    fn test_load_installs_into_repository() {
        let dir = tempfile::tempdir().unwrap();
        let csv = format!(
            "{}\n1;0;10;d;^555$;^777$;.*;0;99999999999;10.0.0.0/24;10.0.0.0/24;sip:%b%@10.0.0.5",
            HEADER_LEGACY
        );
        std::fs::write(dir.path().join("20250101_000000.csv"), csv).unwrap();

        let repo = Arc::new(PolicyRepository::new());
        let loader = PolicyLoader::new(Arc::clone(&repo));
        loader
            .load_latest_from_dir(dir.path().to_str().unwrap())
            .unwrap();
        assert_eq!(repo.version(), "20250101_000000.csv");
        assert_eq!(repo.snapshot().unwrap().rules.len(), 1);
    }
}
