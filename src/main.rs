//! Process bootstrap
//!
//! Startup order: configuration, environment, logging, data loads, servers.
//! Any failure before the servers are up exits non-zero; after that every
//! condition is answered on the wire instead.

use std::process;
use std::sync::Arc;

use tracing::{error, info, warn};

use gomobile::config::Settings;
use gomobile::engine::PolicyEngine;
use gomobile::error::GoMobileResult;
use gomobile::fnm::FnmRepository;
use gomobile::fnm_load::FnmLoader;
use gomobile::logging;
use gomobile::policy::PolicyRepository;
use gomobile::policy_load::PolicyLoader;
use gomobile::server::SipServer;
use gomobile::types::{APP_NAME, VERSION};
use gomobile::web::WebServer;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{} failed to start: {}", APP_NAME, e);
        error!("fatal: {}", e);
        process::exit(1);
    }
}

async fn run() -> GoMobileResult<()> {
    let settings = Settings::load("configs")?;

    // .env supplies HTTP_TOKEN (and MYSQL_PASSWORD in DB deployments);
    // absence is tolerated, the variables may come from the environment
    if dotenvy::dotenv().is_err() {
        eprintln!("no .env file found, relying on process environment");
    }

    let log_mgr = logging::init(
        &settings.logging.directory,
        settings.logging.retain_days,
        settings.flags.debug,
    )?;
    log_mgr.spawn_cleaner();

    // the policy matcher fans out over this pool
    let _ = rayon::ThreadPoolBuilder::new()
        .num_threads(num_cpus::get())
        .build_global();

    let policies = Arc::new(PolicyRepository::new());
    let policy_loader = PolicyLoader::new(Arc::clone(&policies));
    policy_loader.load_latest_from_dir(&settings.data.policy.policy_dir)?;

    let fnm = Arc::new(FnmRepository::new());
    let fnm_loader = FnmLoader::new(Arc::clone(&fnm));
    match fnm_loader.load_latest_from_dir(&settings.data.fnm.fnm_dir, settings.data.fnm.format) {
        Ok(()) => info!("loaded FNM from local file"),
        Err(e) => {
            warn!("no local FNM file loaded: {}", e);
            fnm_loader
                .load_from_api(&settings.data.fnm.api, &settings.data.fnm.fnm_dir)
                .await?;
        }
    }

    starting_message(&settings, &policies);

    let engine = Arc::new(PolicyEngine::new(Arc::clone(&policies), fnm));
    let sip = SipServer::new(Arc::clone(&engine), settings.sipserver.acl.ip.clone());
    let web = WebServer::new(engine);

    tokio::select! {
        res = sip.run(settings.sipserver.port) => res?,
        res = web.run(settings.webserver.port) => res?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }
    Ok(())
}

fn starting_message(settings: &Settings, policies: &PolicyRepository) {
    let banner = format!(
        "{} {} - SIP Redirection Proxy Server",
        APP_NAME, VERSION
    );
    println!("{}", banner);
    println!("{}", config_summary(settings));
    info!("{}", banner);
    info!("pid: {}", process::id());
    info!("policy set: {}", policies.version());
    for line in config_summary(settings).lines() {
        info!("{}", line);
    }
}

fn config_summary(settings: &Settings) -> String {
    let mut out = String::new();
    out.push_str(&format!("sipserver.port: {}\n", settings.sipserver.port));
    if settings.sipserver.acl.ip.is_empty() {
        out.push_str("sipserver.acl: none\n");
    } else {
        for ip in &settings.sipserver.acl.ip {
            out.push_str(&format!("sipserver.acl: {}\n", ip));
        }
    }
    out.push_str(&format!("webserver.port: {}\n", settings.webserver.port));
    out.push_str(&format!("logging.directory: {}\n", settings.logging.directory));
    out.push_str(&format!("logging.retain_days: {}\n", settings.logging.retain_days));
    out.push_str(&format!("data.policy.policy_dir: {}\n", settings.data.policy.policy_dir));
    out.push_str(&format!("data.fnm.fnm_dir: {}\n", settings.data.fnm.fnm_dir));
    out.push_str(&format!("flags.debug: {}", settings.flags.debug));
    out
}
