//! Forwarded-Number-Map records and repository
//!
//! The FNM maps a subscriber number (MSISDN) to its tenant metadata; the
//! policy engine consults it when expanding `%a_int%`, `%b_int%`,
//! `%access_code%` and `%node_ip%`. The repository follows the same
//! snapshot-swap discipline as the policy store.
//!
//! Two record shapes exist. The full JSON record carries the tenant
//! sub-structure (the source serializes it as a nested JSON *string* that is
//! re-parsed after ingestion). The CSV deployment variant carries only
//! `id,did,nexthop` routing rows.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};

/// Per-subscriber tenant metadata
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Tenant {
    #[serde(default)]
    pub account: TenantAccount,
    #[serde(default)]
    pub service: TenantService,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct TenantAccount {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub access_code: String,
    #[serde(default)]
    pub voicenumber: String,
    #[serde(default)]
    pub pincode: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct TenantService {
    #[serde(default, rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub node: String,
}

/// One full FNM record, keyed by MSISDN
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FnmRecord {
    pub msisdn: String,
    pub iccid: String,
    pub internal_number: String,
    pub tenant: Tenant,
}

/// The on-disk/HTTP shape of one record: `tenant` still a JSON string
#[derive(Debug, Deserialize)]
pub struct RawFnmRecord {
    #[serde(default)]
    pub msisdn: String,
    #[serde(default)]
    pub iccid: String,
    #[serde(default)]
    pub internal_number: String,
    #[serde(default)]
    pub tenant: String,
}

impl RawFnmRecord {
    /// Finish ingestion by re-parsing the nested tenant payload.
    /// An unparseable tenant keeps the record with default tenant data.
    pub fn into_record(self) -> FnmRecord {
        let tenant = if self.tenant.is_empty() {
            Tenant::default()
        } else {
            match serde_json::from_str::<Tenant>(&self.tenant) {
                Ok(t) => t,
                Err(e) => {
                    warn!("msisdn {}: unparseable tenant payload: {}", self.msisdn, e);
                    Tenant::default()
                }
            }
        };
        FnmRecord {
            msisdn: self.msisdn,
            iccid: self.iccid,
            internal_number: self.internal_number,
            tenant,
        }
    }
}

/// CSV deployment variant: a bare routing row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NexthopRecord {
    pub id: String,
    pub did: String,
    pub nexthop: String,
}

/// An installed, immutable FNM snapshot
#[derive(Debug)]
pub struct FnmSet {
    pub records: HashMap<String, Arc<FnmRecord>>,
    pub nexthops: Vec<NexthopRecord>,
    pub version: String,
    pub loaded_at: DateTime<Utc>,
}

/// Owner of the current FNM snapshot
#[derive(Debug, Default)]
pub struct FnmRepository {
    current: RwLock<Option<Arc<FnmSet>>>,
}

impl FnmRepository {
    pub fn new() -> Self {
        FnmRepository {
            current: RwLock::new(None),
        }
    }

    /// Atomically install a freshly loaded record set
    pub fn set_records(&self, records: Vec<FnmRecord>, version: impl Into<String>) {
        let map = records
            .into_iter()
            .map(|r| (r.msisdn.clone(), Arc::new(r)))
            .collect::<HashMap<_, _>>();
        self.install(FnmSet {
            records: map,
            nexthops: Vec::new(),
            version: version.into(),
            loaded_at: Utc::now(),
        });
    }

    /// Atomically install a nexthop-only set (CSV deployment variant)
    pub fn set_nexthops(&self, nexthops: Vec<NexthopRecord>, version: impl Into<String>) {
        self.install(FnmSet {
            records: HashMap::new(),
            nexthops,
            version: version.into(),
            loaded_at: Utc::now(),
        });
    }

    fn install(&self, set: FnmSet) {
        let mut guard = self.current.write().expect("fnm store lock poisoned");
        *guard = Some(Arc::new(set));
    }

    /// Snapshot of the installed set; empty before the first load
    pub fn snapshot(&self) -> Option<Arc<FnmSet>> {
        self.current
            .read()
            .expect("fnm store lock poisoned")
            .clone()
    }

    pub fn version(&self) -> String {
        self.snapshot().map(|s| s.version.clone()).unwrap_or_default()
    }

    pub fn last_load_time(&self) -> Option<DateTime<Utc>> {
        self.snapshot().map(|s| s.loaded_at)
    }

    /// Look up a subscriber by MSISDN
    pub fn lookup(&self, msisdn: &str, call_id: &str) -> Option<Arc<FnmRecord>> {
        let set = self.snapshot()?;
        match set.records.get(msisdn) {
            Some(record) => {
                info!(
                    "Call-ID: {} FNM {}: internal {}",
                    call_id, msisdn, record.internal_number
                );
                Some(Arc::clone(record))
            }
            None => {
                warn!("Call-ID: {} no FNM record for {}", call_id, msisdn);
                None
            }
        }
    }

    /// Find a nexthop row by DID (CSV deployment variant)
    pub fn find_nexthop(&self, did: &str) -> Option<NexthopRecord> {
        let set = self.snapshot()?;
        set.nexthops.iter().find(|n| n.did == did).cloned()
    }
}
