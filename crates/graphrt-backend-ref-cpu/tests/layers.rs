use std::sync::Arc;

use anyhow::Result;
use graphrt::backend::{
    priority, BackendError, BackendId, BackendRegistry, BackendResult, KernelScheduler,
    SerialScheduler,
};
use graphrt::graph::{
    ActivationFunction, Convolution2dDescriptor, FullyConnectedDescriptor, Graph, LayerId,
    LayerKind, NetworkBuilder, PaddingMethod, Pooling2dDescriptor, PoolingAlgorithm,
};
use graphrt::tensor::{ConstTensor, DataType, HostTensor, TensorInfo, TensorShape};
use graphrt::{Backend, EngineConfig, EngineState, Error, ExecutionEngine};
use graphrt_backend_ref_cpu::{
    CpuBackend, CpuKernelInterceptor, CpuLayer, CpuTensor, GenericCpuBackend,
};

fn shape(dims: &[u32]) -> TensorShape {
    TensorShape::from_dims(dims)
}

fn build_engine(backend: Arc<dyn Backend>, graph: Graph) -> Result<ExecutionEngine> {
    let registry = BackendRegistry::new();
    let id = backend.id();
    registry.register(backend);
    let config = EngineConfig {
        backend_preferences: vec![id.to_string()],
        ..Default::default()
    };
    let mut engine = ExecutionEngine::new(graph, &registry, config)?;
    engine.build()?;
    Ok(engine)
}

fn reference_engine(graph: Graph) -> Result<ExecutionEngine> {
    build_engine(Arc::new(CpuBackend::new()), graph)
}

/// input -> `layer` -> output, with `layer` added by `add`.
fn single_layer_graph(
    input: TensorInfo,
    add: impl FnOnce(&mut NetworkBuilder) -> graphrt::Result<LayerId>,
) -> Result<Graph> {
    let mut builder = NetworkBuilder::new();
    let x = builder.add_input("input", 0, input)?;
    let layer = add(&mut builder)?;
    let out = builder.add_output("output", 0)?;
    builder.link(x, layer)?;
    builder.link(layer, out)?;
    Ok(builder.finish()?)
}

fn only_output(outputs: Vec<(u32, HostTensor)>) -> HostTensor {
    assert_eq!(outputs.len(), 1);
    outputs.into_iter().next().map(|(_, t)| t).unwrap()
}

fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-5, "got {actual:?}, expected {expected:?}");
    }
}

fn padded_average_pool(method: PaddingMethod) -> Pooling2dDescriptor {
    Pooling2dDescriptor {
        stride_x: 1,
        stride_y: 1,
        pad_left: 1,
        pad_right: 1,
        pad_top: 1,
        pad_bottom: 1,
        padding_method: method,
        ..Pooling2dDescriptor::new(PoolingAlgorithm::Average, 2)
    }
}

#[test]
fn average_pool_padding_methods() -> Result<()> {
    let input = || HostTensor::from_f32(shape(&[1, 2, 2, 1]), &[1.0, 2.0, 3.0, 4.0]);

    let graph = single_layer_graph(TensorInfo::f32(&[1, 2, 2, 1]), |b| {
        b.add_pooling2d("pool", padded_average_pool(PaddingMethod::Exclude))
    })?;
    let mut engine = reference_engine(graph)?;
    let excluded = only_output(engine.execute(&[(0, input()?)])?);
    assert_eq!(excluded.info().shape, shape(&[1, 3, 3, 1]));
    assert_close(
        &excluded.to_f32_vec().unwrap(),
        &[1.0, 1.5, 2.0, 2.0, 2.5, 3.0, 3.0, 3.5, 4.0],
    );

    let graph = single_layer_graph(TensorInfo::f32(&[1, 2, 2, 1]), |b| {
        b.add_pooling2d("pool", padded_average_pool(PaddingMethod::IgnoreValue))
    })?;
    let mut engine = reference_engine(graph)?;
    let ignored = only_output(engine.execute(&[(0, input()?)])?);
    assert_close(
        &ignored.to_f32_vec().unwrap(),
        &[0.25, 0.75, 0.5, 1.0, 2.5, 1.5, 0.75, 1.75, 1.0],
    );
    Ok(())
}

#[test]
fn l2_pool_takes_root_mean_square() -> Result<()> {
    let graph = single_layer_graph(TensorInfo::f32(&[1, 2, 2, 1]), |b| {
        b.add_pooling2d("pool", Pooling2dDescriptor::new(PoolingAlgorithm::L2, 2))
    })?;
    let mut engine = reference_engine(graph)?;
    let input = HostTensor::from_f32(shape(&[1, 2, 2, 1]), &[3.0, 4.0, 0.0, 0.0])?;
    let output = only_output(engine.execute(&[(0, input)])?);
    assert_close(&output.to_f32_vec().unwrap(), &[2.5]);
    Ok(())
}

#[test]
fn quantized_convolution_requantizes_output() -> Result<()> {
    let info = TensorInfo::quantized(shape(&[1, 2, 2, 1]), 0.5, 10);
    let weights = ConstTensor::from_f32(shape(&[1, 2, 2, 1]), &[1.0; 4])?;
    let graph = single_layer_graph(info.clone(), |b| {
        b.add_convolution2d("conv", Convolution2dDescriptor::default(), weights, None)
    })?;
    let mut engine = reference_engine(graph)?;

    // Dequantized input is [1, 2, 3, 4]; the sum 10 requantizes to 10 / 0.5 + 10.
    let input = HostTensor::from_u8(info, &[12, 14, 16, 18])?;
    let output = only_output(engine.execute(&[(0, input)])?);
    assert_eq!(output.data_type(), DataType::QAsymmU8);
    assert_eq!(output.as_u8().unwrap(), &[30]);
    Ok(())
}

#[test]
fn fully_connected_with_transposed_weights_and_fused_clamp() -> Result<()> {
    let weights = ConstTensor::from_f32(shape(&[2, 3]), &[1.0, 1.0, 1.0, 0.0, 1.0, 2.0])?;
    let descriptor = FullyConnectedDescriptor {
        transpose_weights: true,
        ..Default::default()
    };

    let mut builder = NetworkBuilder::new();
    let x = builder.add_input("input", 0, TensorInfo::f32(&[1, 3]))?;
    let fc = builder.add_fully_connected("fc", descriptor, weights, None)?;
    let clamp = builder.add_activation(
        "clamp",
        ActivationFunction::BoundedReLu {
            upper: 7.0,
            lower: 0.0,
        },
    )?;
    let out = builder.add_output("output", 0)?;
    builder.link(x, fc)?;
    builder.link(fc, clamp)?;
    builder.link(clamp, out)?;
    let mut engine = reference_engine(builder.finish()?)?;

    let input = HostTensor::from_f32(shape(&[1, 3]), &[1.0, 2.0, 3.0])?;
    let output = only_output(engine.execute(&[(0, input)])?);
    assert_eq!(output.to_f32_vec().unwrap(), vec![6.0, 7.0]);

    let fc_layer = engine
        .graph()
        .layers()
        .find(|layer| layer.name() == "fc")
        .expect("fc survives fusion");
    assert!(matches!(
        fc_layer.kind(),
        LayerKind::FullyConnected { descriptor, .. } if descriptor.fused_activation.is_some()
    ));
    assert!(engine.graph().layers().all(|layer| layer.name() != "clamp"));
    Ok(())
}

#[test]
fn leaky_relu_and_scaled_softmax() -> Result<()> {
    let graph = single_layer_graph(TensorInfo::f32(&[4]), |b| {
        b.add_activation("leaky", ActivationFunction::LeakyReLu { alpha: 0.1 })
    })?;
    let mut engine = reference_engine(graph)?;
    let input = HostTensor::from_f32(shape(&[4]), &[-2.0, -1.0, 0.0, 3.0])?;
    let output = only_output(engine.execute(&[(0, input)])?);
    assert_close(&output.to_f32_vec().unwrap(), &[-0.2, -0.1, 0.0, 3.0]);

    let graph = single_layer_graph(TensorInfo::f32(&[1, 2]), |b| b.add_softmax("softmax", 2.0))?;
    let mut engine = reference_engine(graph)?;
    let half_ln3 = 0.5 * 3.0f32.ln();
    let input = HostTensor::from_f32(shape(&[1, 2]), &[0.0, half_ln3])?;
    let output = only_output(engine.execute(&[(0, input)])?);
    assert_close(&output.to_f32_vec().unwrap(), &[0.25, 0.75]);
    Ok(())
}

#[test]
fn f16_graphs_have_no_backend() -> Result<()> {
    let info = TensorInfo::new(shape(&[1, 4]), DataType::Float16);
    let graph = single_layer_graph(info, |b| b.add_activation("act", ActivationFunction::TanH))?;
    let Err(err) = reference_engine(graph) else {
        panic!("f16 activation must not build");
    };
    let err = err.downcast::<Error>()?;
    match err {
        Error::BackendUnsupported {
            layer,
            layer_type,
            reasons,
        } => {
            assert_eq!(layer, "act");
            assert_eq!(layer_type, "Activation");
            assert_eq!(reasons.len(), 1);
            assert!(reasons[0].starts_with("ref-cpu"), "{reasons:?}");
        }
        other => panic!("expected BackendUnsupported, got {other}"),
    }
    Ok(())
}

#[test]
fn allocator_capacity_limits_build() -> Result<()> {
    let graph = single_layer_graph(TensorInfo::f32(&[1, 4, 4, 1]), |b| {
        b.add_activation("relu", ActivationFunction::ReLu)
    })?;
    let Err(err) = build_engine(Arc::new(CpuBackend::new().with_memory_capacity(16)), graph) else {
        panic!("a 64 byte tensor cannot fit a 16 byte allocator");
    };
    let err = err.downcast::<Error>()?;
    assert!(matches!(err, Error::OutOfMemory { .. }), "{err}");
    Ok(())
}

/// Fails every softmax and defers everything else to the reference kernels.
struct FailingSoftmax;

impl CpuKernelInterceptor for FailingSoftmax {
    fn try_execute(
        &self,
        layer: &CpuLayer,
        _inputs: &[CpuTensor],
        _scheduler: &dyn KernelScheduler,
        _dst: &mut [f32],
    ) -> Option<BackendResult<()>> {
        matches!(layer.kind, LayerKind::Softmax { .. })
            .then(|| Err(BackendError::execution("softmax disabled")))
    }
}

#[test]
fn failing_workload_moves_engine_to_failed() -> Result<()> {
    let id = BackendId::new("failing-cpu");
    let backend = GenericCpuBackend::with_parts(
        id,
        priority::REFERENCE,
        FailingSoftmax,
        Arc::new(SerialScheduler::new()),
    );

    let mut builder = NetworkBuilder::new();
    let x = builder.add_input("input", 0, TensorInfo::f32(&[1, 4]))?;
    let relu = builder.add_activation("relu", ActivationFunction::ReLu)?;
    let softmax = builder.add_softmax("softmax", 1.0)?;
    let out = builder.add_output("output", 0)?;
    builder.link(x, relu)?;
    builder.link(relu, softmax)?;
    builder.link(softmax, out)?;
    let mut engine = build_engine(Arc::new(backend), builder.finish()?)?;

    let input = || HostTensor::from_f32(shape(&[1, 4]), &[1.0, -1.0, 2.0, -2.0]);
    let err = engine.execute(&[(0, input()?)]).unwrap_err();
    match &err {
        Error::WorkloadExecutionFailure {
            layer,
            backend,
            source,
        } => {
            assert_eq!(layer, "softmax");
            assert_eq!(*backend, id);
            assert!(matches!(source, BackendError::Execution { .. }));
        }
        other => panic!("expected WorkloadExecutionFailure, got {other}"),
    }
    assert_eq!(engine.state(), EngineState::Failed);
    assert_eq!(engine.dispatch_order().len(), 1, "relu ran before the failure");

    assert!(matches!(
        engine.bind_inputs(&[(0, input()?)]),
        Err(Error::InvalidState { .. })
    ));
    engine.reset()?;
    assert_eq!(engine.state(), EngineState::Built);
    Ok(())
}
