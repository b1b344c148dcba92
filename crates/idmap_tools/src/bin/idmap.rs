#![forbid(unsafe_code)]

use std::env;

use idmap_contracts::mapping::NonAssociationKey;
use idmap_os::clock::SystemMappingClock;
use idmap_os::config::MappingServiceConfig;
use idmap_os::service::MappingService;
use idmap_storage::audit::MappingAuditLedger;
use idmap_storage::journal::JournaledMappingStore;
use idmap_tools::cli::{execute_idmap_command, NON_ASSOCIATION_TABLE, USAGE};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(2);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = env::args().skip(1).collect();
    let subcommand = args.first().ok_or_else(|| USAGE.to_string())?;

    let config = MappingServiceConfig::from_env()?;
    let store = JournaledMappingStore::<NonAssociationKey>::open(&config.store_path, NON_ASSOCIATION_TABLE)
        .map_err(|e| format!("failed to open {}: {e}", config.store_path.display()))?;
    let audit_path = config.audit_path();
    let audit = MappingAuditLedger::open(&audit_path)
        .map_err(|e| format!("failed to open {}: {e}", audit_path.display()))?;
    let service =
        MappingService::with_audit_ledger(config, store, SystemMappingClock::new(), audit)
            .map_err(|e| e.to_string())?;

    let result = execute_idmap_command(&service, subcommand, &args[1..]);
    let (store, audit) = service.into_parts();
    store.close().map_err(|e| e.to_string())?;
    audit.close().map_err(|e| e.to_string())?;
    let output = result?;
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}
