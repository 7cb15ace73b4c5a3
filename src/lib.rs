//! goMobile - SIP redirect proxy and voice-routing policy engine
//!
//! Terminates INVITE transactions on UDP, classifies each call against a
//! prioritized rule set, substitutes call-dependent variables into the
//! matched redirect target and answers 302 Moved Temporarily (or 502 Bad
//! Gateway). Rule and FNM data live in hot-swappable in-memory snapshots
//! loaded from disk or HTTP.

pub mod config;
pub mod engine;
pub mod error;
pub mod fnm;
pub mod fnm_load;
pub mod logging;
pub mod message;
pub mod policy;
pub mod policy_load;
pub mod server;
pub mod types;
pub mod web;

pub use config::Settings;
pub use engine::{PolicyEngine, SimData, SimLookup};
pub use error::{GoMobileError, GoMobileResult};
pub use fnm::{FnmRecord, FnmRepository};
pub use fnm_load::FnmLoader;
pub use policy::{PolicyRepository, Rule};
pub use policy_load::PolicyLoader;
pub use server::SipServer;
pub use types::{CallInputs, Method, PolicyResult};
pub use web::WebServer;
