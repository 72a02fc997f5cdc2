use graphrt::backend::{priority, BackendRegistry, MemoryDomain};
use graphrt_backend_ref_cpu::{register_cpu_backend, REF_CPU_ID};

#[test]
fn global_registry_contains_ref_cpu() {
    let registry = BackendRegistry::global();
    assert!(registry.has_backend(REF_CPU_ID.as_str()));

    let backend = registry.get("ref-cpu").expect("ref-cpu registered at link time");
    let capabilities = backend.capabilities();
    assert_eq!(capabilities.priority, priority::REFERENCE);
    assert_eq!(capabilities.memory_domain, MemoryDomain::Host);
}

#[test]
fn manual_registration_is_idempotent() {
    let registry = BackendRegistry::new();
    register_cpu_backend(&registry);
    register_cpu_backend(&registry);
    assert_eq!(registry.list_backends(), vec![REF_CPU_ID]);
}
