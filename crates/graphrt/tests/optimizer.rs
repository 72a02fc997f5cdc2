mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use common::{activation_chain, addition_graph, built_engine, MockBackend};
use graphrt::graph::{
    ActivationFunction, Convolution2dDescriptor, FullyConnectedDescriptor, Graph, LayerKind,
    LayerType, NetworkBuilder, Pooling2dDescriptor, PoolingAlgorithm,
};
use graphrt::optimizer::passes::{FusionPass, ValidationPass};
use graphrt::optimizer::{
    GraphPass, OptimizeConfig, OptimizeContext, Optimizer, PassResult, PipelineBuilder,
};
use graphrt::tensor::{ConstTensor, TensorInfo, TensorShape};
use graphrt::{Backend, EngineConfig, Error};

fn compute_backend() -> Arc<dyn Backend> {
    Arc::new(MockBackend::new("mock", 100).supporting(&[
        LayerType::Convolution2d,
        LayerType::FullyConnected,
        LayerType::Addition,
        LayerType::Activation,
    ]))
}

fn context(config: OptimizeConfig) -> OptimizeContext {
    OptimizeContext::new(vec![compute_backend()], config)
}

/// input -> conv(1x1, 2 -> 3) -> add(bias constant) -> relu -> output, with an optional
/// second consumer of the convolution output.
fn conv_bias_relu(extra_consumer: bool) -> Result<Graph> {
    let mut builder = NetworkBuilder::new();
    let x = builder.add_input("input", 0, TensorInfo::f32(&[1, 4, 4, 2]))?;
    let weights = ConstTensor::from_f32(TensorShape::from_dims(&[3, 1, 1, 2]), &[1.0; 6])?;
    let conv = builder.add_convolution2d("conv", Convolution2dDescriptor::default(), weights, None)?;
    let bias = builder.add_constant(
        "bias",
        ConstTensor::from_f32(TensorShape::from_dims(&[1, 1, 1, 3]), &[0.5, 1.0, 1.5])?,
    )?;
    let add = builder.add_addition("add")?;
    let relu = builder.add_activation("relu", ActivationFunction::ReLu)?;
    let out = builder.add_output("output", 0)?;
    builder.link(x, conv)?;
    builder.link(conv, add)?;
    builder.link(bias, add)?;
    builder.link(add, relu)?;
    builder.link(relu, out)?;
    if extra_consumer {
        let side = builder.add_output("side", 1)?;
        builder.link(conv, side)?;
    }
    Ok(builder.finish()?)
}

fn layer_types(graph: &Graph) -> Vec<LayerType> {
    let mut types: Vec<_> = graph.layers().map(|layer| layer.layer_type()).collect();
    types.sort_by_key(|t| t.as_str());
    types
}

#[test]
fn conv_bias_activation_chain_fuses() -> Result<()> {
    let mut graph = conv_bias_relu(false)?;
    let mut cx = context(OptimizeConfig::default());
    let stats = Optimizer::new(cx.config).optimize(&mut graph, &mut cx)?;
    assert!(stats.changed);
    assert_eq!(stats.erased_layers, 3, "add, relu and the dead bias constant");

    assert_eq!(
        layer_types(&graph),
        vec![LayerType::Convolution2d, LayerType::Input, LayerType::Output]
    );
    let conv = graph.layers().find(|layer| layer.name() == "conv").unwrap();
    match conv.kind() {
        LayerKind::Convolution2d {
            descriptor, bias, ..
        } => {
            assert!(descriptor.bias_enabled);
            assert_eq!(descriptor.fused_activation, Some(ActivationFunction::ReLu));
            assert_eq!(bias.as_ref().and_then(|b| b.to_f32_vec()), Some(vec![0.5, 1.0, 1.5]));
        }
        other => panic!("expected a convolution, got {other:?}"),
    }
    assert_eq!(
        conv.output_info(0).map(|info| info.shape.clone()),
        Some(TensorShape::from_dims(&[1, 4, 4, 3]))
    );
    Ok(())
}

#[test]
fn shared_intermediate_blocks_fusion() -> Result<()> {
    let mut graph = conv_bias_relu(true)?;
    let before = graph.len();
    let mut cx = context(OptimizeConfig::default());
    Optimizer::new(cx.config).optimize(&mut graph, &mut cx)?;
    assert_eq!(graph.len(), before);
    Ok(())
}

#[test]
fn fusion_needs_a_supporting_backend() -> Result<()> {
    let mut graph = conv_bias_relu(false)?;
    let before = graph.len();
    let backend: Arc<dyn Backend> = Arc::new(
        MockBackend::new("no-conv", 100).supporting(&[LayerType::Addition, LayerType::Activation]),
    );
    let mut cx = OptimizeContext::new(vec![backend], OptimizeConfig::default());
    let mut builder = PipelineBuilder::new();
    builder.pass(Arc::new(ValidationPass));
    builder.pass(Arc::new(FusionPass));
    let stats = Optimizer::from_steps(builder.finish()).optimize(&mut graph, &mut cx)?;
    assert_eq!(stats.erased_layers, 0);
    assert_eq!(graph.len(), before);
    Ok(())
}

#[test]
fn disabled_fusion_keeps_layers() -> Result<()> {
    let mut graph = conv_bias_relu(false)?;
    let before = graph.len();
    let mut cx = context(OptimizeConfig {
        enable_fusion: false,
        ..Default::default()
    });
    Optimizer::new(cx.config).optimize(&mut graph, &mut cx)?;
    assert_eq!(graph.len(), before);
    Ok(())
}

#[test]
fn fully_connected_absorbs_activation() -> Result<()> {
    let mut builder = NetworkBuilder::new();
    let x = builder.add_input("input", 0, TensorInfo::f32(&[2, 3]))?;
    let weights = ConstTensor::from_f32(TensorShape::from_dims(&[3, 4]), &[0.25; 12])?;
    let fc = builder.add_fully_connected("fc", FullyConnectedDescriptor::default(), weights, None)?;
    let act = builder.add_activation("sigmoid", ActivationFunction::Sigmoid)?;
    let out = builder.add_output("output", 0)?;
    builder.link(x, fc)?;
    builder.link(fc, act)?;
    builder.link(act, out)?;
    let mut graph = builder.finish()?;

    let mut cx = context(OptimizeConfig::default());
    let stats = Optimizer::new(cx.config).optimize(&mut graph, &mut cx)?;
    assert_eq!(stats.erased_layers, 1);
    let fc = graph.layers().find(|layer| layer.name() == "fc").unwrap();
    assert_eq!(fc.kind().fused_activation(), Some(ActivationFunction::Sigmoid));
    assert_eq!(
        fc.output_info(0).map(|info| info.shape.clone()),
        Some(TensorShape::from_dims(&[2, 4]))
    );
    Ok(())
}

#[test]
fn optimizing_twice_changes_nothing() -> Result<()> {
    for mut graph in [conv_bias_relu(false)?, conv_bias_relu(true)?, activation_chain(&[8])] {
        let mut cx = context(OptimizeConfig::default());
        let optimizer = Optimizer::new(cx.config);
        optimizer.optimize(&mut graph, &mut cx)?;
        let snapshot = graph.clone();

        let second = optimizer.optimize(&mut graph, &mut cx)?;
        assert!(!second.changed);
        assert_eq!(second.rewrites_applied, 0);
        assert_eq!(graph, snapshot);
    }
    Ok(())
}

#[test]
fn incompatible_broadcast_is_a_shape_mismatch() -> Result<()> {
    let graph = addition_graph(&[2, 3], &[3, 2])?;
    match built_engine(graph, compute_backend(), EngineConfig::default()) {
        Err(Error::ShapeMismatch { layer, .. }) => assert_eq!(layer, "add"),
        Err(other) => panic!("expected ShapeMismatch, got {other}"),
        Ok(_) => panic!("[2, 3] + [3, 2] must not build"),
    }
    Ok(())
}

#[test]
fn overflowing_padding_is_a_shape_mismatch() -> Result<()> {
    let mut descriptor = Pooling2dDescriptor::new(PoolingAlgorithm::Max, 2);
    descriptor.pad_left = u32::MAX;
    descriptor.pad_right = 1;
    let mut builder = NetworkBuilder::new();
    let x = builder.add_input("input", 0, TensorInfo::f32(&[1, 4, 4, 1]))?;
    let pool = builder.add_pooling2d("pool", descriptor)?;
    let out = builder.add_output("output", 0)?;
    builder.link(x, pool)?;
    builder.link(pool, out)?;

    match built_engine(builder.finish()?, compute_backend(), EngineConfig::default()) {
        Err(Error::ShapeMismatch { layer, detail }) => {
            assert_eq!(layer, "pool");
            assert!(detail.contains("overflows"), "{detail}");
        }
        Err(other) => panic!("expected ShapeMismatch, got {other}"),
        Ok(_) => panic!("padding past u32::MAX must not build"),
    }
    Ok(())
}

/// Claims a change on every run.
struct AlwaysChanged {
    runs: AtomicUsize,
}

impl GraphPass for AlwaysChanged {
    fn name(&self) -> &'static str {
        "always-changed"
    }

    fn run(&self, _graph: &mut Graph, _cx: &mut OptimizeContext) -> graphrt::Result<PassResult> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(PassResult {
            changed: true,
            rewrites_applied: 1,
            ..PassResult::unchanged()
        })
    }
}

#[test]
fn fixed_point_is_bounded() -> Result<()> {
    let pass = Arc::new(AlwaysChanged {
        runs: AtomicUsize::new(0),
    });
    let mut builder = PipelineBuilder::new();
    builder.fixed_point(3, |inner| inner.pass(Arc::clone(&pass) as Arc<dyn GraphPass>));
    let optimizer = Optimizer::from_steps(builder.finish());

    let mut graph = activation_chain(&[2]);
    let mut cx = context(OptimizeConfig::default());
    let stats = optimizer.optimize(&mut graph, &mut cx)?;
    assert_eq!(pass.runs.load(Ordering::SeqCst), 3);
    assert_eq!(stats.iterations, 3);
    assert_eq!(stats.rewrites_applied, 3);
    Ok(())
}
