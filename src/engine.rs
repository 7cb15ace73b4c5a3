//! Call classification and redirect-target resolution
//!
//! `PolicyEngine::find_policy_result` is the single entry point both
//! transports use: select the best rule for the call, then expand the
//! call-dependent variables in its target. Every placeholder the target
//! names must resolve, otherwise the call is answered 502 with the failing
//! variable in the Reason header.

use std::sync::Arc;

use regex::Regex;
use tracing::{error, info, warn};

use crate::fnm::{FnmRecord, FnmRepository};
use crate::policy::PolicyRepository;
use crate::types::{CallInputs, PolicyResult};

/// Domain suffix appended to a tenant's node tag to form its FQDN
const NODE_DOMAIN_SUFFIX: &str = ".cocobri.ru";

/// Tenant metadata supplied by the external SIM database.
///
/// Only the narrow slice the legacy expander consumes; the DB schema behind
/// it stays outside this crate.
#[derive(Debug, Clone, Default)]
pub struct SimData {
    pub access_code: String,
    pub voicenumber: String,
    pub node: String,
}

/// The "resolve a number's tenant metadata" capability.
///
/// The FNM store and the DB-backed lookup are alternative providers; the
/// engine only ever sees this trait.
pub trait SimLookup: Send + Sync {
    fn lookup(&self, msisdn: &str) -> Option<SimData>;
}

pub struct PolicyEngine {
    policies: Arc<PolicyRepository>,
    fnm: Arc<FnmRepository>,
    sim_lookup: Option<Arc<dyn SimLookup>>,
}

impl PolicyEngine {
    /// Engine resolving tenant metadata from the FNM store only
    pub fn new(policies: Arc<PolicyRepository>, fnm: Arc<FnmRepository>) -> Self {
        PolicyEngine {
            policies,
            fnm,
            sim_lookup: None,
        }
    }

    /// Engine with the DB-backed lookup attached; target expansion switches
    /// to the legacy placeholder set
    pub fn with_sim_lookup(
        policies: Arc<PolicyRepository>,
        fnm: Arc<FnmRepository>,
        sim_lookup: Arc<dyn SimLookup>,
    ) -> Self {
        PolicyEngine {
            policies,
            fnm,
            sim_lookup: Some(sim_lookup),
        }
    }

    /// Classify one call and produce its redirect target.
    pub fn find_policy_result(&self, inputs: &CallInputs) -> PolicyResult {
        let call_id = inputs.call_id.as_str();
        info!(
            "Call-ID: {} finding policy for numA={} numB={} numC={}",
            call_id, inputs.num_a, inputs.num_b, inputs.num_c
        );

        let best = self.policies.find_best(
            &inputs.num_a,
            &inputs.num_b,
            &inputs.num_c,
            inputs.now_unix,
            &inputs.src_ip,
            &inputs.sbc_ip,
            call_id,
        );
        let Some(best) = best else {
            warn!("Call-ID: {} no matching policy found", call_id);
            return PolicyResult::bad_gateway("Policies not found");
        };

        info!(
            "Call-ID: {} best policy: ID={} Target={} Priority={}",
            call_id, best.id, best.target, best.priority
        );

        let expanded = match &self.sim_lookup {
            None => self.expand_fnm(&best.target, &inputs.num_a, &inputs.num_b, call_id, &inputs.ruri),
            Some(sim) => Ok(self.expand_legacy(
                &best.target,
                &inputs.num_a,
                &inputs.num_b,
                &inputs.num_c,
                sim.as_ref(),
            )),
        };

        match expanded {
            Ok(target) => {
                let target = target.trim().to_string();
                info!("Call-ID: {} final target: {}", call_id, target);
                PolicyResult {
                    target,
                    reason: String::new(),
                    priority: best.priority,
                    id: best.id,
                }
            }
            Err(placeholder) => {
                error!(
                    "Call-ID: {} failed to resolve placeholder {}",
                    call_id, placeholder
                );
                PolicyResult::bad_gateway(format!("Cannot resolve variable {}", placeholder))
            }
        }
    }

    /// Primary expander over the FNM placeholder set.
    ///
    /// Placeholders are tried in a fixed order; one that the target names
    /// but whose resolver comes back empty aborts the expansion with that
    /// placeholder as the error value.
    fn expand_fnm(
        &self,
        target: &str,
        num_a: &str,
        num_b: &str,
        call_id: &str,
        ruri: &str,
    ) -> Result<String, String> {
        let fnm_a = self.fnm.lookup(num_a, call_id);
        let fnm_b = self.fnm.lookup(num_b, call_id);

        let mut target = target.to_string();

        let internal_of = |rec: &Option<Arc<FnmRecord>>| {
            rec.as_ref()
                .map(|r| r.internal_number.clone())
                .unwrap_or_default()
        };

        // %access_code% and %node_ip% belong to the called subscriber,
        // except when num_b is a short extension (length 3..=5): the caller
        // owns the tenant then.
        let tenant_record = if num_b.len() > 2 && num_b.len() <= 5 {
            &fnm_a
        } else {
            &fnm_b
        };

        let steps: [(&str, Box<dyn Fn() -> String + '_>); 8] = [
            ("%a_int%", Box::new(|| internal_of(&fnm_a))),
            ("%a%", Box::new(|| num_a.to_string())),
            ("%b%", Box::new(|| num_b.to_string())),
            ("%b_int%", Box::new(|| internal_of(&fnm_b))),
            ("%shared_did%", Box::new(|| num_b.to_string())),
            (
                "%access_code%",
                Box::new(|| {
                    tenant_record
                        .as_ref()
                        .map(|r| r.tenant.account.access_code.clone())
                        .unwrap_or_default()
                }),
            ),
            (
                "%node_ip%",
                Box::new(|| {
                    tenant_record
                        .as_ref()
                        .map(|r| node_fqdn(&r.tenant.service.node))
                        .unwrap_or_default()
                }),
            ),
            ("%ruri%", Box::new(|| ruri.to_string())),
        ];

        for (placeholder, resolve) in steps {
            if !contains_ignore_case(&target, placeholder) {
                continue;
            }
            let value = resolve();
            if value.is_empty() {
                return Err(placeholder.to_string());
            }
            info!(
                "Call-ID: {} replacing placeholder {} with {}",
                call_id, placeholder, value
            );
            target = replace_ignore_case(&target, placeholder, &value);
        }
        Ok(target)
    }

    /// Legacy expander used when the SIM database collaborator is attached.
    ///
    /// Unresolvable tokens stay in the target unchanged and never fail the
    /// call; surrounding quotes are trimmed from the result.
    fn expand_legacy(
        &self,
        target: &str,
        num_a: &str,
        num_b: &str,
        num_c: &str,
        sim_lookup: &dyn SimLookup,
    ) -> String {
        let sim = sim_lookup.lookup(num_b);

        let mut target = target.to_string();
        let steps: [(&str, String); 6] = [
            ("%A%", num_a.to_string()),
            ("%B%", num_b.to_string()),
            ("%C%", num_c.to_string()),
            (
                "%PBX_VOICE%",
                sim.as_ref().map(|s| s.voicenumber.clone()).unwrap_or_default(),
            ),
            (
                "%PBX_ACCESS%",
                sim.as_ref().map(|s| s.access_code.clone()).unwrap_or_default(),
            ),
            (
                "%NODE_IP%",
                sim.as_ref().map(|s| node_fqdn(&s.node)).unwrap_or_default(),
            ),
        ];

        for (placeholder, value) in steps {
            if value.is_empty() {
                continue;
            }
            target = replace_ignore_case(&target, placeholder, &value);
        }
        target.trim_matches('"').to_string()
    }
}

/// Resolve a tenant node tag to its FQDN; an empty tag resolves to nothing
fn node_fqdn(node: &str) -> String {
    if node.is_empty() {
        return String::new();
    }
    format!("{}{}", node, NODE_DOMAIN_SUFFIX)
}

fn contains_ignore_case(target: &str, placeholder: &str) -> bool {
    target.to_lowercase().contains(&placeholder.to_lowercase())
}

/// Replace every case-insensitive occurrence of `placeholder` with `value`
fn replace_ignore_case(target: &str, placeholder: &str, value: &str) -> String {
    if value.is_empty() {
        return target.to_string();
    }
    let re = Regex::new(&format!("(?i){}", regex::escape(placeholder)))
        .expect("placeholder is a valid literal pattern");
    re.replace_all(target, |_: &regex::Captures| value.to_string())
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fnm::{FnmRecord, Tenant, TenantAccount, TenantService};
    use crate::policy::{NumberPattern, Rule};
    use std::sync::atomic::AtomicU64;

    fn match_all_rule(target: &str) -> Rule {
        Rule {
            id: 1,
            state: 0,
            priority: 10,
            description: String::new(),
            num_a: NumberPattern::compiled(Regex::new(".*").unwrap()),
            num_b: NumberPattern::compiled(Regex::new(".*").unwrap()),
            num_c: NumberPattern::compiled(Regex::new(".*").unwrap()),
            period_start: 0,
            period_stop: 99_999_999_999,
            src_cidrs: vec!["0.0.0.0/0".parse().unwrap()],
            sbc_cidrs: vec!["0.0.0.0/0".parse().unwrap()],
            target: target.to_string(),
            src_type: String::new(),
            require_sim_a: None,
            require_sim_b: None,
            operator_b: String::new(),
            match_counter: AtomicU64::new(0),
        }
    }

    fn fnm_record(msisdn: &str, internal: &str, access_code: &str, node: &str) -> FnmRecord {
        FnmRecord {
            msisdn: msisdn.to_string(),
            iccid: String::new(),
            internal_number: internal.to_string(),
            tenant: Tenant {
                account: TenantAccount {
                    access_code: access_code.to_string(),
                    ..Default::default()
                },
                service: TenantService {
                    node: node.to_string(),
                    ..Default::default()
                },
            },
        }
    }

    fn engine_with(target: &str, records: Vec<FnmRecord>) -> PolicyEngine {
        let policies = Arc::new(PolicyRepository::new());
        policies.set_rules(vec![match_all_rule(target)], "test.csv");
        let fnm = Arc::new(FnmRepository::new());
        fnm.set_records(records, "test.json");
        PolicyEngine::new(policies, fnm)
    }

    fn run(engine: &PolicyEngine, num_a: &str, num_b: &str) -> PolicyResult {
        engine.find_policy_result(&CallInputs {
            num_a: num_a.to_string(),
            num_b: num_b.to_string(),
            num_c: String::new(),
            src_ip: "10.0.0.7".to_string(),
            sbc_ip: "10.0.0.7".to_string(),
            call_id: "cid".to_string(),
            ruri: "10.0.0.1".to_string(),
            now_unix: 1000,
        })
    }

    #[test]
    fn test_plain_number_substitution() {
        let engine = engine_with(" sip:%b%@10.0.0.5 ", vec![]);
        let result = run(&engine, "555", "777");
        assert_eq!(result.target, "sip:777@10.0.0.5");
        assert_eq!(result.priority, 10);
        assert_eq!(result.id, 1);
    }

    #[test]
    fn test_no_policy_found() {
        let policies = Arc::new(PolicyRepository::new());
        policies.set_rules(vec![], "empty.csv");
        let engine = PolicyEngine::new(policies, Arc::new(FnmRepository::new()));
        let result = run(&engine, "555", "777");
        assert!(result.is_bad_gateway());
        assert_eq!(result.reason, "Policies not found");
    }

    #[test]
    fn test_unresolvable_placeholder() {
        let engine = engine_with("sip:%a_int%@node", vec![]);
        let result = run(&engine, "555", "777");
        assert!(result.is_bad_gateway());
        assert_eq!(result.reason, "Cannot resolve variable %a_int%");
    }

    #[test]
    fn test_case_insensitive_placeholders() {
        let engine = engine_with("sip:%B%@%RuRi%", vec![]);
        let result = run(&engine, "555", "777");
        assert_eq!(result.target, "sip:777@10.0.0.1");
    }

    #[test]
    fn test_internal_numbers_from_fnm() {
        let engine = engine_with(
            "sip:%a_int%-%b_int%@pbx",
            vec![
                fnm_record("555", "1001", "", ""),
                fnm_record("777777", "1002", "", ""),
            ],
        );
        let result = run(&engine, "555", "777777");
        assert_eq!(result.target, "sip:1001-1002@pbx");
    }

    #[test]
    fn test_access_code_uses_callee_tenant() {
        let engine = engine_with(
            "sip:%access_code%@%node_ip%",
            vec![fnm_record("79001110000", "1001", "9999", "spb01")],
        );
        // num_b is a full number, so its own FNM record supplies the tenant
        let result = run(&engine, "555", "79001110000");
        assert_eq!(result.target, "sip:9999@spb01.cocobri.ru");
    }

    #[test]
    fn test_short_extension_falls_back_to_caller() {
        let records = vec![fnm_record("555", "1001", "4821", "msk01")];
        for ext in ["123", "1234", "12345"] {
            let engine = engine_with("sip:%access_code%@%node_ip%", records.clone());
            let result = run(&engine, "555", ext);
            assert_eq!(result.target, "sip:4821@msk01.cocobri.ru", "ext {}", ext);
        }
    }

    #[test]
    fn test_length_two_does_not_fall_back() {
        // num_b of length 2 keeps the callee lookup, which is absent here
        let engine = engine_with(
            "sip:%access_code%@pbx",
            vec![fnm_record("555", "1001", "4821", "msk01")],
        );
        let result = run(&engine, "555", "12");
        assert!(result.is_bad_gateway());
        assert_eq!(result.reason, "Cannot resolve variable %access_code%");
    }

    #[test]
    fn test_length_six_uses_callee() {
        let engine = engine_with(
            "sip:%access_code%@pbx",
            vec![
                fnm_record("555", "1001", "1111", "a"),
                fnm_record("123456", "1002", "2222", "b"),
            ],
        );
        let result = run(&engine, "555", "123456");
        assert_eq!(result.target, "sip:2222@pbx");
    }

    #[test]
    fn test_empty_node_tag_is_unresolvable() {
        let engine = engine_with(
            "sip:x@%node_ip%",
            vec![fnm_record("79001110000", "1001", "9999", "")],
        );
        let result = run(&engine, "555", "79001110000");
        assert!(result.is_bad_gateway());
        assert_eq!(result.reason, "Cannot resolve variable %node_ip%");
    }

    #[test]
    fn test_expander_idempotent_on_resolved_output() {
        let engine = engine_with("sip:%b%@10.0.0.5|sip:%a%@10.0.0.6", vec![]);
        let first = run(&engine, "555", "777");
        let engine2 = engine_with(&first.target, vec![]);
        let second = run(&engine2, "555", "777");
        assert_eq!(first.target, second.target);
    }

    #[test]
    fn test_replace_ignore_case_is_literal() {
        // a value containing regex metacharacters must be inserted verbatim
        let out = replace_ignore_case("sip:%b%@h", "%b%", "user$1");
        assert_eq!(out, "sip:user$1@h");
    }

    struct FixedSim(SimData);
    impl SimLookup for FixedSim {
        fn lookup(&self, _msisdn: &str) -> Option<SimData> {
            Some(self.0.clone())
        }
    }

    #[test]
    fn test_legacy_expander() {
        let policies = Arc::new(PolicyRepository::new());
        policies.set_rules(
            vec![match_all_rule("\"sip:%B%@%NODE_IP%;key=%PBX_ACCESS%\"")],
            "test.csv",
        );
        let sim = Arc::new(FixedSim(SimData {
            access_code: "77".to_string(),
            voicenumber: "500".to_string(),
            node: "msk01".to_string(),
        }));
        let engine =
            PolicyEngine::with_sim_lookup(policies, Arc::new(FnmRepository::new()), sim);
        let result = run(&engine, "555", "777");
        assert_eq!(result.target, "sip:777@msk01.cocobri.ru;key=77");
    }

    #[test]
    fn test_legacy_leaves_unresolved_tokens() {
        struct NoSim;
        impl SimLookup for NoSim {
            fn lookup(&self, _msisdn: &str) -> Option<SimData> {
                None
            }
        }
        let policies = Arc::new(PolicyRepository::new());
        policies.set_rules(vec![match_all_rule("sip:%B%@%PBX_VOICE%")], "test.csv");
        let engine = PolicyEngine::with_sim_lookup(
            policies,
            Arc::new(FnmRepository::new()),
            Arc::new(NoSim),
        );
        let result = run(&engine, "555", "777");
        // the number resolves, the PBX token stays, the call is not failed
        assert_eq!(result.target, "sip:777@%PBX_VOICE%");
        assert!(!result.is_bad_gateway());
    }

    #[test]
    fn test_node_fqdn() {
        assert_eq!(node_fqdn("msk01"), "msk01.cocobri.ru");
        assert_eq!(node_fqdn(""), "");
    }
}
