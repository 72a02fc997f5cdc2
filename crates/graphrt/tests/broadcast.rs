mod common;

use std::sync::Arc;

use anyhow::Result;
use common::{addition_graph, built_engine, f32_tensor, output_values, MockBackend};
use graphrt::graph::broadcast_shapes;
use graphrt::{EngineConfig, TensorShape};

#[test]
fn broadcast_takes_the_larger_extent_or_fails() {
    for a in 1..=3u32 {
        for b in 1..=3u32 {
            let lhs = TensorShape::from_dims(&[a, 2]);
            let rhs = TensorShape::from_dims(&[b, 2]);
            let result = broadcast_shapes(&lhs, &rhs);
            if a == b || a == 1 || b == 1 {
                assert_eq!(result, Ok(TensorShape::from_dims(&[a.max(b), 2])));
                assert_eq!(broadcast_shapes(&rhs, &lhs), result);
            } else {
                assert!(result.is_err(), "{lhs} and {rhs} should not broadcast");
            }
        }
    }
}

#[test]
fn ranks_must_match() {
    let lhs = TensorShape::from_dims(&[3]);
    let rhs = TensorShape::from_dims(&[1, 3]);
    assert!(broadcast_shapes(&lhs, &rhs).is_err());
}

#[test]
fn addition_broadcasts_rows_against_columns() -> Result<()> {
    let mut engine = built_engine(
        addition_graph(&[2, 1], &[1, 3])?,
        Arc::new(MockBackend::new("mock", 100)),
        EngineConfig::default(),
    )?;
    let outputs = engine.execute(&[
        (0, f32_tensor(&[2, 1], &[10.0, 20.0])),
        (1, f32_tensor(&[1, 3], &[1.0, 2.0, 3.0])),
    ])?;
    assert_eq!(outputs[0].1.info().shape, TensorShape::from_dims(&[2, 3]));
    assert_eq!(
        output_values(&outputs, 0),
        vec![11.0, 12.0, 13.0, 21.0, 22.0, 23.0]
    );
    Ok(())
}
