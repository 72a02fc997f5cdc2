use std::sync::Arc;

use graphrt::backend::{Backend, BackendRegistry};
use graphrt::graph::{
    ActivationFunction, Convolution2dDescriptor, FullyConnectedDescriptor, Graph, LayerKind,
    NetworkBuilder, PaddingMethod, Pooling2dDescriptor, PoolingAlgorithm,
};
use graphrt::profiling::Profiler;
use graphrt::tensor::{ConstTensor, HostTensor, TensorInfo, TensorShape};
use graphrt::{EngineConfig, EngineState, Error, ExecutionEngine};

use crate::recording_backend::RecordingBackend;

fn shape(dims: &[u32]) -> TensorShape {
    TensorShape::from_dims(dims)
}

fn engine_on<B: Backend + 'static>(
    backend: &Arc<B>,
    graph: Graph,
    config: EngineConfig,
) -> ExecutionEngine {
    let registry = BackendRegistry::new();
    registry.register(Arc::clone(backend) as Arc<dyn Backend>);
    engine_in(&registry, backend.id().as_str(), graph, config)
}

fn engine_in(
    registry: &BackendRegistry,
    backend: &str,
    graph: Graph,
    config: EngineConfig,
) -> ExecutionEngine {
    let config = EngineConfig {
        backend_preferences: vec![backend.to_string()],
        ..config
    };
    let mut engine = ExecutionEngine::new(graph, registry, config).expect("engine config is valid");
    engine.build().expect("graph builds");
    engine
}

fn first_output(outputs: Vec<(u32, HostTensor)>) -> HostTensor {
    outputs
        .into_iter()
        .next()
        .map(|(_, tensor)| tensor)
        .expect("graph has an output")
}

fn run_f32(engine: &mut ExecutionEngine, inputs: &[(u32, HostTensor)]) -> Vec<f32> {
    let output = first_output(engine.execute(inputs).expect("run succeeds"));
    output.to_f32_vec().expect("output decodes to f32")
}

fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (index, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tolerance,
            "value {index}: got {a}, expected {e}"
        );
    }
}

/// input -> 2x2 average pool (stride 2, no padding) -> output
fn average_pool_graph(input: TensorInfo) -> Graph {
    let mut builder = NetworkBuilder::new();
    let x = builder.add_input("input", 0, input).unwrap();
    let pool = builder
        .add_pooling2d(
            "pool",
            Pooling2dDescriptor::new(PoolingAlgorithm::Average, 2),
        )
        .unwrap();
    let out = builder.add_output("output", 0).unwrap();
    builder.link(x, pool).unwrap();
    builder.link(pool, out).unwrap();
    builder.finish().unwrap()
}

pub fn average_pool_matches_expected<B: Backend + 'static>(backend: &Arc<B>) {
    let graph = average_pool_graph(TensorInfo::f32(&[1, 2, 2, 1]));
    let mut engine = engine_on(backend, graph, EngineConfig::default());

    let input = HostTensor::from_f32(shape(&[1, 2, 2, 1]), &[2.0, 3.0, 5.0, 2.0]).unwrap();
    let outputs = engine.execute(&[(0, input)]).unwrap();
    let output = first_output(outputs);

    assert_eq!(output.info().shape, shape(&[1, 1, 1, 1]));
    assert_eq!(output.to_f32_vec().unwrap(), vec![3.0]);
    assert_eq!(engine.state(), EngineState::Completed);
}

pub fn quantized_average_pool_matches_expected<B: Backend + 'static>(backend: &Arc<B>) {
    let info = TensorInfo::quantized(shape(&[1, 2, 2, 1]), 1.0, 0);
    let mut engine = engine_on(backend, average_pool_graph(info.clone()), EngineConfig::default());

    let input = HostTensor::from_u8(info, &[2, 3, 5, 2]).unwrap();
    let output = first_output(engine.execute(&[(0, input)]).unwrap());

    assert_eq!(output.info().shape, shape(&[1, 1, 1, 1]));
    assert_eq!(output.as_u8().unwrap(), &[3]);
}

pub fn quantized_average_pool_rounds_half_away_from_zero<B: Backend + 'static>(
    backend: &Arc<B>,
) {
    let info = TensorInfo::quantized(shape(&[1, 4, 4, 1]), 1.0, 0);
    let mut engine = engine_on(backend, average_pool_graph(info.clone()), EngineConfig::default());

    #[rustfmt::skip]
    let values = [
        1, 2, 2, 3,
        5, 6, 7, 8,
        3, 2, 1, 0,
        1, 2, 3, 4,
    ];
    let input = HostTensor::from_u8(info, &values).unwrap();
    let output = first_output(engine.execute(&[(0, input)]).unwrap());

    // The first window averages to 3.5.
    assert_eq!(output.info().shape, shape(&[1, 2, 2, 1]));
    assert_eq!(output.as_u8().unwrap(), &[4, 5, 2, 2]);
}

pub fn quantized_data_on_float_graph_is_rejected<B: Backend + 'static>(backend: &Arc<B>) {
    let graph = average_pool_graph(TensorInfo::f32(&[1, 2, 2, 1]));
    let mut engine = engine_on(backend, graph, EngineConfig::default());

    let input = HostTensor::from_u8(
        TensorInfo::quantized(shape(&[1, 2, 2, 1]), 1.0, 0),
        &[2, 3, 5, 2],
    )
    .unwrap();
    let err = engine.execute(&[(0, input)]).unwrap_err();

    assert!(matches!(err, Error::TypeMismatch { binding: 0, .. }), "{err}");
    assert_eq!(engine.state(), EngineState::Built);
}

pub fn max_pool_with_padding_matches_expected<B: Backend + 'static>(backend: &Arc<B>) {
    let mut descriptor = Pooling2dDescriptor::new(PoolingAlgorithm::Max, 2);
    descriptor.pad_right = 1;
    descriptor.pad_bottom = 1;
    descriptor.padding_method = PaddingMethod::Exclude;

    let mut builder = NetworkBuilder::new();
    let x = builder
        .add_input("input", 0, TensorInfo::f32(&[1, 3, 3, 1]))
        .unwrap();
    let pool = builder.add_pooling2d("pool", descriptor).unwrap();
    let out = builder.add_output("output", 0).unwrap();
    builder.link(x, pool).unwrap();
    builder.link(pool, out).unwrap();
    let mut engine = engine_on(backend, builder.finish().unwrap(), EngineConfig::default());

    let values: Vec<f32> = (1..=9).map(|v| v as f32).collect();
    let input = HostTensor::from_f32(shape(&[1, 3, 3, 1]), &values).unwrap();
    assert_eq!(run_f32(&mut engine, &[(0, input)]), vec![5.0, 6.0, 8.0, 9.0]);
}

pub fn fully_connected_matches_expected<B: Backend + 'static>(backend: &Arc<B>) {
    let weights = ConstTensor::from_f32(shape(&[3, 2]), &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0]).unwrap();
    let bias = ConstTensor::from_f32(shape(&[2]), &[0.5, -1.0]).unwrap();
    let descriptor = FullyConnectedDescriptor {
        bias_enabled: true,
        ..Default::default()
    };

    let mut builder = NetworkBuilder::new();
    let x = builder.add_input("input", 0, TensorInfo::f32(&[2, 3])).unwrap();
    let fc = builder
        .add_fully_connected("fc", descriptor, weights, Some(bias))
        .unwrap();
    let out = builder.add_output("output", 0).unwrap();
    builder.link(x, fc).unwrap();
    builder.link(fc, out).unwrap();
    let mut engine = engine_on(backend, builder.finish().unwrap(), EngineConfig::default());

    let input = HostTensor::from_f32(shape(&[2, 3]), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
    assert_close(
        &run_f32(&mut engine, &[(0, input)]),
        &[4.5, 4.0, 10.5, 10.0],
        1e-5,
    );
}

pub fn convolution_with_padding_matches_expected<B: Backend + 'static>(backend: &Arc<B>) {
    let weights = ConstTensor::from_f32(shape(&[1, 3, 3, 1]), &[1.0; 9]).unwrap();
    let descriptor = Convolution2dDescriptor {
        pad_left: 1,
        pad_right: 1,
        pad_top: 1,
        pad_bottom: 1,
        ..Default::default()
    };

    let mut builder = NetworkBuilder::new();
    let x = builder
        .add_input("input", 0, TensorInfo::f32(&[1, 3, 3, 1]))
        .unwrap();
    let conv = builder
        .add_convolution2d("conv", descriptor, weights, None)
        .unwrap();
    let out = builder.add_output("output", 0).unwrap();
    builder.link(x, conv).unwrap();
    builder.link(conv, out).unwrap();
    let mut engine = engine_on(backend, builder.finish().unwrap(), EngineConfig::default());

    let values: Vec<f32> = (1..=9).map(|v| v as f32).collect();
    let input = HostTensor::from_f32(shape(&[1, 3, 3, 1]), &values).unwrap();
    assert_close(
        &run_f32(&mut engine, &[(0, input)]),
        &[12.0, 21.0, 16.0, 27.0, 45.0, 33.0, 24.0, 39.0, 28.0],
        1e-4,
    );
}

/// input -> conv -> add(bias constant) -> relu -> output
fn conv_bias_relu_graph() -> Graph {
    let weights: Vec<f32> = (0..3 * 2 * 2 * 2)
        .map(|k| ((k % 5) as f32 - 2.0) * 0.5)
        .collect();
    let weights = ConstTensor::from_f32(shape(&[3, 2, 2, 2]), &weights).unwrap();
    let bias = ConstTensor::from_f32(shape(&[1, 1, 1, 3]), &[0.25, -0.5, 1.0]).unwrap();

    let mut builder = NetworkBuilder::new();
    let x = builder
        .add_input("input", 0, TensorInfo::f32(&[1, 4, 4, 2]))
        .unwrap();
    let conv = builder
        .add_convolution2d("conv", Convolution2dDescriptor::default(), weights, None)
        .unwrap();
    let b = builder.add_constant("bias", bias).unwrap();
    let add = builder.add_addition("bias_add").unwrap();
    let relu = builder
        .add_activation("relu", ActivationFunction::ReLu)
        .unwrap();
    let out = builder.add_output("output", 0).unwrap();
    builder.link(x, conv).unwrap();
    builder.link(conv, add).unwrap();
    builder.link(b, add).unwrap();
    builder.link(add, relu).unwrap();
    builder.link(relu, out).unwrap();
    builder.finish().unwrap()
}

pub fn fused_convolution_matches_unfused<B: Backend + 'static>(backend: &Arc<B>) {
    let values: Vec<f32> = (0..32).map(|i| i as f32 * 0.25 - 4.0).collect();
    let input = || HostTensor::from_f32(shape(&[1, 4, 4, 2]), &values).unwrap();

    let recording = Arc::new(RecordingBackend::wrap(
        Arc::clone(backend) as Arc<dyn Backend>
    ));
    let registry = BackendRegistry::new();
    registry.register(Arc::clone(&recording) as Arc<dyn Backend>);
    let mut fused = engine_in(
        &registry,
        backend.id().as_str(),
        conv_bias_relu_graph(),
        EngineConfig::default(),
    );
    let fused_out = run_f32(&mut fused, &[(0, input())]);

    let created = recording.created_workloads();
    assert_eq!(created.len(), 1, "{created:?}");
    match &created[0].1 {
        LayerKind::Convolution2d {
            descriptor, bias, ..
        } => {
            assert_eq!(descriptor.fused_activation, Some(ActivationFunction::ReLu));
            assert!(descriptor.bias_enabled && bias.is_some());
        }
        other => panic!("expected a fused convolution, got {other:?}"),
    }

    let mut unfused = engine_on(
        backend,
        conv_bias_relu_graph(),
        EngineConfig {
            enable_fusion: false,
            ..Default::default()
        },
    );
    let unfused_out = run_f32(&mut unfused, &[(0, input())]);

    assert_eq!(fused_out.len(), 3 * 3 * 3);
    assert!(fused_out.iter().all(|v| *v >= 0.0));
    assert_close(&fused_out, &unfused_out, 1e-4);
}

pub fn broadcast_multiplication_matches_expected<B: Backend + 'static>(backend: &Arc<B>) {
    let mut builder = NetworkBuilder::new();
    let lhs = builder.add_input("lhs", 0, TensorInfo::f32(&[2, 3])).unwrap();
    let rhs = builder.add_input("rhs", 1, TensorInfo::f32(&[1, 3])).unwrap();
    let mul = builder.add_multiplication("mul").unwrap();
    let out = builder.add_output("output", 0).unwrap();
    builder.link(lhs, mul).unwrap();
    builder.link(rhs, mul).unwrap();
    builder.link(mul, out).unwrap();
    let mut engine = engine_on(backend, builder.finish().unwrap(), EngineConfig::default());

    let a = HostTensor::from_f32(shape(&[2, 3]), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
    let b = HostTensor::from_f32(shape(&[1, 3]), &[1.0, 10.0, 100.0]).unwrap();
    assert_eq!(
        run_f32(&mut engine, &[(0, a), (1, b)]),
        vec![1.0, 20.0, 300.0, 4.0, 50.0, 600.0]
    );
}

pub fn softmax_rows_sum_to_one<B: Backend + 'static>(backend: &Arc<B>) {
    let mut builder = NetworkBuilder::new();
    let x = builder.add_input("input", 0, TensorInfo::f32(&[2, 4])).unwrap();
    let softmax = builder.add_softmax("softmax", 1.0).unwrap();
    let out = builder.add_output("output", 0).unwrap();
    builder.link(x, softmax).unwrap();
    builder.link(softmax, out).unwrap();
    let mut engine = engine_on(backend, builder.finish().unwrap(), EngineConfig::default());

    let input = HostTensor::from_f32(
        shape(&[2, 4]),
        &[1.0, 2.0, 3.0, 4.0, 7.0, 7.0, 7.0, 7.0],
    )
    .unwrap();
    let output = run_f32(&mut engine, &[(0, input)]);

    let (first, second) = output.split_at(4);
    assert!((first.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    assert!(first.windows(2).all(|pair| pair[0] < pair[1]));
    assert_close(second, &[0.25; 4], 1e-6);
}

pub fn reshape_preserves_values<B: Backend + 'static>(backend: &Arc<B>) {
    let mut builder = NetworkBuilder::new();
    let x = builder.add_input("input", 0, TensorInfo::f32(&[1, 2, 3])).unwrap();
    let reshape = builder.add_reshape("reshape", shape(&[3, 2])).unwrap();
    let out = builder.add_output("output", 0).unwrap();
    builder.link(x, reshape).unwrap();
    builder.link(reshape, out).unwrap();
    let mut engine = engine_on(backend, builder.finish().unwrap(), EngineConfig::default());

    let values = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let input = HostTensor::from_f32(shape(&[1, 2, 3]), &values).unwrap();
    let output = first_output(engine.execute(&[(0, input)]).unwrap());

    assert_eq!(output.info().shape, shape(&[3, 2]));
    assert_eq!(output.to_f32_vec().unwrap(), values.to_vec());
}

/// input -> conv (padded) -> max pool -> softmax -> output
fn profiled_graph() -> Graph {
    let weights: Vec<f32> = (0..2 * 3 * 3).map(|k| (k as f32 - 8.0) * 0.125).collect();
    let weights = ConstTensor::from_f32(shape(&[2, 3, 3, 1]), &weights).unwrap();
    let descriptor = Convolution2dDescriptor {
        pad_left: 1,
        pad_right: 1,
        pad_top: 1,
        pad_bottom: 1,
        ..Default::default()
    };

    let mut builder = NetworkBuilder::new();
    let x = builder
        .add_input("input", 0, TensorInfo::f32(&[1, 4, 4, 1]))
        .unwrap();
    let conv = builder
        .add_convolution2d("conv", descriptor, weights, None)
        .unwrap();
    let pool = builder
        .add_pooling2d("pool", Pooling2dDescriptor::new(PoolingAlgorithm::Max, 2))
        .unwrap();
    let softmax = builder.add_softmax("softmax", 1.0).unwrap();
    let out = builder.add_output("output", 0).unwrap();
    builder.link(x, conv).unwrap();
    builder.link(conv, pool).unwrap();
    builder.link(pool, softmax).unwrap();
    builder.link(softmax, out).unwrap();
    builder.finish().unwrap()
}

pub fn profiling_is_transparent<B: Backend + 'static>(backend: &Arc<B>) {
    let values: Vec<f32> = (0..16).map(|i| (i as f32).sin()).collect();
    let input = || HostTensor::from_f32(shape(&[1, 4, 4, 1]), &values).unwrap();

    let mut plain = engine_on(backend, profiled_graph(), EngineConfig::default());
    let expected = run_f32(&mut plain, &[(0, input())]);

    let profiler = Arc::new(Profiler::new());
    let mut profiled = engine_on(
        backend,
        profiled_graph(),
        EngineConfig {
            profiling: true,
            ..Default::default()
        },
    )
    .with_profiler(Arc::clone(&profiler));
    let actual = run_f32(&mut profiled, &[(0, input())]);
    assert_eq!(actual, expected);

    let report = profiled
        .profiling_report()
        .expect("profiled run leaves a report");
    let labels: Vec<&str> = report
        .workloads
        .iter()
        .map(|record| record.label.as_str())
        .collect();
    assert_eq!(labels, vec!["conv", "pool", "softmax"]);
    assert_eq!(report.dispatch.len(), 3, "one kernel dispatch per workload");
    assert!(report
        .dispatch
        .windows(2)
        .all(|pair| pair[0].1.start_offset <= pair[1].1.start_offset));
    assert_eq!(
        report.kernels.values().map(Vec::len).sum::<usize>(),
        report.dispatch.len()
    );

    // The scheduler is restored once the run ends: a plain run records nothing new.
    let again = run_f32(&mut plain, &[(0, input())]);
    assert_eq!(again, expected);
    assert!(profiler.kernel_measurements().is_empty());
}

pub fn repeated_runs_are_stable<B: Backend + 'static>(backend: &Arc<B>) {
    let graph = average_pool_graph(TensorInfo::f32(&[1, 2, 2, 1]));
    let mut engine = engine_on(backend, graph, EngineConfig::default());

    let first = HostTensor::from_f32(shape(&[1, 2, 2, 1]), &[2.0, 3.0, 5.0, 2.0]).unwrap();
    let second = HostTensor::from_f32(shape(&[1, 2, 2, 1]), &[4.0, 4.0, 8.0, 8.0]).unwrap();

    assert_eq!(run_f32(&mut engine, &[(0, first.clone())]), vec![3.0]);
    assert_eq!(run_f32(&mut engine, &[(0, second)]), vec![6.0]);
    engine.reset().unwrap();
    assert_eq!(engine.state(), EngineState::Built);
    assert_eq!(run_f32(&mut engine, &[(0, first)]), vec![3.0]);
}
