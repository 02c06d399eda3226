mod common;

use std::env;

use common::init_logger;
use offheap_guard::{ConfigError, GuardConfig, GuardError, MemoryGuard, RegistryStrategy};

const VARS: [&str; 6] = [
    "OFFHEAP_GUARD_SAFE_MEMORY_MANAGEMENT",
    "OFFHEAP_GUARD_SAFE_MEMORY_ACCESS",
    "OFFHEAP_GUARD_CONCURRENT_ACCESS_CHECK",
    "OFFHEAP_GUARD_THREAD_LOCAL_MEMORY_USAGE",
    "OFFHEAP_GUARD_ALLOCATION_PATH_MONITORING",
    "OFFHEAP_GUARD_REGISTRY",
];

// One test per binary, so nothing else reads the environment meanwhile.
#[test]
fn config_from_env_works() {
    init_logger();
    for var in VARS {
        env::remove_var(var);
    }
    assert_eq!(GuardConfig::from_env().unwrap(), GuardConfig::default());

    env::set_var("OFFHEAP_GUARD_SAFE_MEMORY_MANAGEMENT", "yes");
    env::set_var("OFFHEAP_GUARD_SAFE_MEMORY_ACCESS", "ON");
    env::set_var("OFFHEAP_GUARD_REGISTRY", "range");
    let config = GuardConfig::from_env().unwrap();
    assert!(config.safe_memory_management);
    assert!(config.safe_memory_access);
    assert!(!config.concurrent_access_check);
    assert_eq!(config.registry, RegistryStrategy::Range);
    let guard = MemoryGuard::new(config).unwrap();
    assert!(guard.is_safe_memory_management_enabled());
    assert!(guard.is_safe_memory_access_enabled());
    assert!(guard.access_lock().is_none());

    env::set_var("OFFHEAP_GUARD_REGISTRY", "exact");
    let config = GuardConfig::from_env().unwrap();
    assert!(matches!(
        MemoryGuard::new(config),
        Err(GuardError::Config(ConfigError::IncompatibleStrategy { .. }))
    ));

    env::set_var("OFFHEAP_GUARD_CONCURRENT_ACCESS_CHECK", "sometimes");
    match GuardConfig::from_env() {
        Err(ConfigError::InvalidFlag { name, value }) => {
            assert_eq!(name, "OFFHEAP_GUARD_CONCURRENT_ACCESS_CHECK");
            assert_eq!(value, "sometimes");
        }
        other => panic!("expected an invalid flag, got {other:?}"),
    }

    for var in VARS {
        env::remove_var(var);
    }
}
