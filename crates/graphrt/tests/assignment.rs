mod common;

use std::sync::Arc;

use anyhow::Result;
use common::{activation_chain, f32_tensor, output_values, registry_with, MockBackend};
use graphrt::backend::{BackendId, MemoryDomain};
use graphrt::graph::{ActivationFunction, LayerType, NetworkBuilder};
use graphrt::memory::HostAllocator;
use graphrt::tensor::{DataType, TensorInfo, TensorShape};
use graphrt::{Backend, EngineConfig, EngineState, Error, ExecutionEngine};

fn backend(id: &'static str, priority: u32) -> Arc<dyn Backend> {
    shared(MockBackend::new(id, priority))
}

fn shared(backend: MockBackend) -> Arc<dyn Backend> {
    Arc::new(backend)
}

#[test]
fn registry_orders_by_priority() {
    let registry = registry_with(vec![
        backend("low", 100),
        backend("high", 300),
        backend("mid", 200),
        backend("mid-late", 200),
    ]);
    let ids: Vec<_> = registry.list_backends().iter().map(|id| id.as_str()).collect();
    assert_eq!(ids, vec!["high", "mid", "mid-late", "low"]);

    registry.register(backend("high", 50));
    let ids: Vec<_> = registry.list_backends().iter().map(|id| id.as_str()).collect();
    assert_eq!(ids, vec!["mid", "mid-late", "low", "high"]);
}

#[test]
fn preferences_select_and_order_backends() -> Result<()> {
    let registry = registry_with(vec![backend("fast", 300), backend("slow", 100)]);

    let mut engine = ExecutionEngine::new(activation_chain(&[3]), &registry, EngineConfig::default())?;
    engine.build()?;
    assert!(engine.assignments().values().all(|id| id.as_str() == "fast"));

    let config = EngineConfig {
        backend_preferences: vec!["slow".to_string(), "fast".to_string()],
        ..Default::default()
    };
    let mut engine = ExecutionEngine::new(activation_chain(&[3]), &registry, config)?;
    engine.build()?;
    assert!(engine.assignments().values().all(|id| id.as_str() == "slow"));

    let config = EngineConfig {
        backend_preferences: vec!["missing".to_string()],
        ..Default::default()
    };
    let Err(err) = ExecutionEngine::new(activation_chain(&[3]), &registry, config) else {
        panic!("unknown backend names are rejected");
    };
    assert!(matches!(err, Error::Config(message) if message.contains("missing")));
    Ok(())
}

#[test]
fn first_supporting_backend_wins_per_layer() -> Result<()> {
    let registry = registry_with(vec![
        shared(MockBackend::new("adds", 300).supporting(&[LayerType::Addition])),
        backend("general", 100),
    ]);
    let mut builder = NetworkBuilder::new();
    let a = builder.add_input("a", 0, TensorInfo::f32(&[2]))?;
    let b = builder.add_input("b", 1, TensorInfo::f32(&[2]))?;
    let add = builder.add_addition("add")?;
    let relu = builder.add_activation("relu", ActivationFunction::ReLu)?;
    let out = builder.add_output("output", 0)?;
    builder.link(a, add)?;
    builder.link(b, add)?;
    builder.link(add, relu)?;
    builder.link(relu, out)?;

    let mut engine = ExecutionEngine::new(builder.finish()?, &registry, EngineConfig::default())?;
    engine.build()?;
    let assignments = engine.assignments();
    assert_eq!(assignments["add"].as_str(), "adds");
    assert_eq!(assignments["relu"].as_str(), "general");
    assert_eq!(assignments["a"].as_str(), "adds");
    assert_eq!(assignments["output"].as_str(), "general");

    let outputs = engine.execute(&[
        (0, f32_tensor(&[2], &[1.0, -4.0])),
        (1, f32_tensor(&[2], &[2.0, 1.0])),
    ])?;
    assert_eq!(output_values(&outputs, 0), vec![3.0, 0.0]);
    Ok(())
}

#[test]
fn unsupported_layer_reports_every_backend() -> Result<()> {
    let registry = registry_with(vec![
        shared(MockBackend::new("first", 200).supporting(&[LayerType::Addition])),
        shared(MockBackend::new("second", 100).supporting(&[LayerType::Multiplication])),
    ]);
    let mut engine = ExecutionEngine::new(activation_chain(&[2]), &registry, EngineConfig::default())?;
    match engine.build() {
        Err(Error::BackendUnsupported {
            layer,
            layer_type,
            reasons,
        }) => {
            assert_eq!(layer, "relu");
            assert_eq!(layer_type, "Activation");
            assert_eq!(reasons.len(), 2);
            assert!(reasons[0].starts_with("first"));
            assert!(reasons[1].starts_with("second"));
        }
        other => panic!("expected BackendUnsupported, got {other:?}"),
    }
    Ok(())
}

#[test]
fn workload_creation_refusal_is_unsupported() -> Result<()> {
    let backend = Arc::new(MockBackend::new("mock", 100).refusing_to_create("linear"));
    let registry = registry_with(vec![Arc::clone(&backend) as Arc<dyn Backend>]);
    let mut engine = ExecutionEngine::new(activation_chain(&[2]), &registry, EngineConfig::default())?;
    engine.build()?;

    match engine.execute(&[(0, f32_tensor(&[2], &[1.0, -1.0]))]) {
        Err(Error::BackendUnsupported {
            layer,
            layer_type,
            reasons,
        }) => {
            assert_eq!(layer, "linear");
            assert_eq!(layer_type, "Activation");
            assert_eq!(reasons.len(), 1);
            assert!(reasons[0].starts_with("mock: Activation is not supported"));
            assert!(reasons[0].contains("weights are not resident"));
        }
        Err(other) => panic!("expected BackendUnsupported, got {other}"),
        Ok(_) => panic!("linear has no workload"),
    }
    assert_eq!(engine.state(), EngineState::Failed);
    assert_eq!(backend.created_workloads(), vec!["relu", "linear"]);
    Ok(())
}

#[test]
fn unsupported_data_type_is_rejected() -> Result<()> {
    let registry = registry_with(vec![backend("mock", 100)]);
    let mut builder = NetworkBuilder::new();
    let info = TensorInfo::new(TensorShape::from_dims(&[4]), DataType::Float16);
    let x = builder.add_input("input", 0, info)?;
    let relu = builder.add_activation("relu", ActivationFunction::ReLu)?;
    let out = builder.add_output("output", 0)?;
    builder.link(x, relu)?;
    builder.link(relu, out)?;

    let mut engine = ExecutionEngine::new(builder.finish()?, &registry, EngineConfig::default())?;
    assert!(matches!(
        engine.build(),
        Err(Error::BackendUnsupported { layer, .. }) if layer == "relu"
    ));
    Ok(())
}

#[test]
fn copies_are_inserted_between_memory_domains() -> Result<()> {
    let device = Arc::new(
        MockBackend::new("device", 300)
            .in_domain(MemoryDomain::Device("gpu"))
            .supporting(&[LayerType::Multiplication]),
    );
    let host = Arc::new(MockBackend::new("host", 100).supporting(&[LayerType::Activation]));
    let registry = registry_with(vec![
        Arc::clone(&device) as Arc<dyn Backend>,
        Arc::clone(&host) as Arc<dyn Backend>,
    ]);

    // input a -> relu (host) -> mul (device) <- input b
    let mut builder = NetworkBuilder::new();
    let a = builder.add_input("a", 0, TensorInfo::f32(&[3]))?;
    let b = builder.add_input("b", 1, TensorInfo::f32(&[3]))?;
    let relu = builder.add_activation("relu", ActivationFunction::ReLu)?;
    let mul = builder.add_multiplication("mul")?;
    let out = builder.add_output("output", 0)?;
    builder.link(a, relu)?;
    builder.link(relu, mul)?;
    builder.link(b, mul)?;
    builder.link(mul, out)?;

    let mut engine = ExecutionEngine::new(builder.finish()?, &registry, EngineConfig::default())?;
    engine.build()?;

    let copies: Vec<_> = engine
        .graph()
        .layers()
        .filter(|layer| layer.layer_type() == LayerType::MemCopy)
        .map(|layer| (layer.name().to_string(), layer.backend()))
        .collect();
    assert_eq!(
        copies,
        vec![("relu -> mul copy".to_string(), Some(BackendId::new("device")))]
    );

    let outputs = engine.execute(&[
        (0, f32_tensor(&[3], &[-1.0, 2.0, 3.0])),
        (1, f32_tensor(&[3], &[5.0, 5.0, -2.0])),
    ])?;
    assert_eq!(output_values(&outputs, 0), vec![0.0, 10.0, -6.0]);
    assert_eq!(host.created_workloads(), vec!["relu"]);
    assert_eq!(device.created_workloads(), vec!["relu -> mul copy", "mul"]);
    Ok(())
}

#[test]
fn memory_limit_fails_build() -> Result<()> {
    let registry = registry_with(vec![backend("mock", 100)]);
    let config = EngineConfig {
        memory_limit_bytes: Some(100),
        ..Default::default()
    };
    // The chain needs two pooled 64-byte buffers.
    let mut engine = ExecutionEngine::new(activation_chain(&[16]), &registry, config)?;
    match engine.build() {
        Err(Error::OutOfMemory {
            backend,
            requested,
            limit,
            ..
        }) => {
            assert_eq!(backend.as_str(), "mock");
            assert_eq!(requested, 64);
            assert_eq!(limit, 100);
        }
        other => panic!("expected OutOfMemory, got {other:?}"),
    }
    Ok(())
}

#[test]
fn allocator_capacity_is_respected() -> Result<()> {
    let small = MockBackend::new("small", 100).with_allocator(HostAllocator::new(16).with_capacity(32));
    let registry = registry_with(vec![shared(small)]);
    let mut engine = ExecutionEngine::new(activation_chain(&[16]), &registry, EngineConfig::default())?;
    assert!(matches!(engine.build(), Err(Error::OutOfMemory { .. })));
    Ok(())
}
