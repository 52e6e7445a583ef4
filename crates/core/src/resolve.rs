use std::time::Instant;

use rustc_hash::FxHashMap;

use crate::{
    ir::{IrRecord, PlaneRule},
    ConvertError,
};

/// Assigns final indices, turns symbolic inbounds into indices and propagates plane counts.
///
/// Records must already be in dependency order; a reference to a later record is an error.
pub struct IndexResolver;

impl IndexResolver {
    pub fn resolve(records: &mut [IrRecord]) -> Result<(), ConvertError> {
        let start = Instant::now();

        let index: FxHashMap<String, usize> = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.name.clone(), i))
            .collect();

        for i in 0..records.len() {
            let (done, rest) = records.split_at_mut(i);
            let record = &mut rest[0];

            let mut input_id = Vec::with_capacity(record.inbounds.len());
            for name in &record.inbounds {
                let Some(&idx) = index.get(name) else {
                    return Err(ConvertError::InvalidGraph(
                        format!("'{}' references unknown layer '{name}'", record.name).into(),
                    ));
                };
                if idx >= i {
                    return Err(ConvertError::InvalidGraph(
                        format!(
                            "'{}' (layer {i}) references '{name}' (layer {idx}), which comes later",
                            record.name
                        )
                        .into(),
                    ));
                }
                input_id.push(idx);
            }

            let planes_of = |idx: usize| done[idx].output_planes.unwrap_or(done[idx].input_planes);
            record.input_planes = match (record.plane_rule, input_id.first()) {
                (_, None) => 0,
                (PlaneRule::First, Some(&first)) => planes_of(first),
                (PlaneRule::Sum, _) => input_id.iter().map(|&idx| planes_of(idx)).sum(),
            };
            if record.output_planes.is_none() {
                record.output_planes = Some(record.input_planes);
            }
            record.num_inputs = input_id.len();
            record.input_id = input_id;
        }

        log::info!("resolve_indices({}): {:?}", records.len(), start.elapsed());
        Ok(())
    }
}

#[test]
fn planes_flow_forward() {
    let mut records = vec![
        IrRecord::new("a", "InputLayer").with_output_planes(8u32),
        IrRecord::new("b", "Activation").with_inbounds(["a"]),
        IrRecord::new("c", "Flatten").with_inbounds(["b"]),
    ];
    IndexResolver::resolve(&mut records).unwrap();
    assert_eq!(records[0].input_planes, 0);
    assert_eq!(records[2].input_id, vec![1]);
    assert_eq!(records[2].input_planes, 8);
    assert_eq!(records[2].output_planes, Some(8));
}

#[test]
fn elementwise_takes_first_operand() {
    let mut records = vec![
        IrRecord::new("x", "Conv2D").with_output_planes(16u32),
        IrRecord::new("y", "Conv2D").with_output_planes(32u32),
        IrRecord::new("add", "Add")
            .with_inbounds(["x", "y"])
            .with_plane_rule(PlaneRule::First),
        IrRecord::new("cat", "Concatenate").with_inbounds(["x", "y"]),
    ];
    IndexResolver::resolve(&mut records).unwrap();
    assert_eq!(records[2].input_planes, 16);
    assert_eq!(records[2].num_inputs, 2);
    assert_eq!(records[3].input_planes, 48);
}

#[test]
fn backward_reference_fails() {
    let mut records = vec![
        IrRecord::new("a", "Activation").with_inbounds(["b"]),
        IrRecord::new("b", "InputLayer"),
    ];
    assert!(matches!(
        IndexResolver::resolve(&mut records),
        Err(ConvertError::InvalidGraph(_))
    ));

    let mut records = vec![IrRecord::new("a", "Activation").with_inbounds(["ghost"])];
    assert!(IndexResolver::resolve(&mut records).is_err());
}
