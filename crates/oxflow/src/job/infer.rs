// Per-op inference rules
//
// Each built-in operator kind maps the attributes of its inputs (already
// resolved by the context, in argument order) to the attribute of its single
// output. Inference is pure: the same conf and inputs always produce the
// same attribute.
//
// Batch and split axes are tracked through every rule:
//   - elementwise ops keep them, aligned from the right under broadcasting
//   - matmul keeps the row axis of `a` and the column axis of `b`
//   - reshape keeps axis 0 only when the leading dim is unchanged
//   - reduce_sum drops reduced axes and renumbers the rest
// Reducing or contracting over a split axis would produce a partial sum,
// which is rejected.

use oxflow_core::{BlobAttr, BlobDesc, DType, OpKind, OperatorConf, ParallelConf, Shape};

use crate::{Error, Result};

/// Infer the output attribute of `op` placed on `pc`.
pub(crate) fn infer_op(
    op: &OperatorConf,
    pc: &ParallelConf,
    inputs: &[&BlobAttr],
) -> Result<BlobAttr> {
    let name = op.name.as_str();
    let output = |desc: BlobDesc, batch_axis: Option<i64>, split_axis: Option<i64>| BlobAttr {
        desc,
        batch_axis,
        split_axis,
        parallel_conf: pc.clone(),
        disable_boxing: false,
    };

    let attr = match &op.kind {
        OpKind::Input { blob } => {
            blob.shape
                .check_positive()
                .map_err(|e| invalid(name, e.to_string()))?;
            let rank = blob.shape.rank();
            check_axis(name, "batch_axis", blob.batch_axis, rank)?;
            check_axis(name, "split_axis", blob.split_axis, rank)?;
            if blob.split_axis.is_some() && blob.batch_axis.is_none() {
                return Err(invalid(name, "split_axis is set without batch_axis"));
            }
            let desc = BlobDesc {
                shape: blob.shape.clone(),
                data_type: blob.data_type,
                is_dynamic: blob.is_dynamic,
                is_tensor_list: blob.is_tensor_list,
            };
            output(desc, blob.batch_axis, blob.split_axis)
        }
        OpKind::Variable {
            shape,
            data_type,
            split_axis,
        } => {
            shape.check_positive().map_err(|e| invalid(name, e.to_string()))?;
            check_axis(name, "split_axis", *split_axis, shape.rank())?;
            output(BlobDesc::new(shape.clone(), *data_type), None, *split_axis)
        }
        OpKind::Return { .. } => {
            let x = arg(name, inputs, 0)?;
            output(x.desc.clone(), x.batch_axis, x.split_axis)
        }
        OpKind::Unary { .. } => {
            let x = arg(name, inputs, 0)?;
            reject_tensor_list(name, x)?;
            output(x.desc.clone(), x.batch_axis, x.split_axis)
        }
        OpKind::Cast { data_type, .. } => {
            let x = arg(name, inputs, 0)?;
            reject_tensor_list(name, x)?;
            let mut desc = x.desc.clone();
            desc.data_type = *data_type;
            output(desc, x.batch_axis, x.split_axis)
        }
        OpKind::Binary { .. } => {
            let (l, r) = (arg(name, inputs, 0)?, arg(name, inputs, 1)?);
            reject_tensor_list(name, l)?;
            reject_tensor_list(name, r)?;
            check_dtype(name, l.desc.data_type, r.desc.data_type)?;
            let shape = Shape::broadcast_shape(&l.desc.shape, &r.desc.shape).ok_or_else(|| {
                Error::ShapeMismatch {
                    op: name.to_string(),
                    expected: l.desc.shape.clone(),
                    got: r.desc.shape.clone(),
                }
            })?;
            let out_rank = shape.rank();
            let align = |axis: Option<i64>, in_rank: usize| {
                axis.map(|a| a + (out_rank - in_rank) as i64)
            };
            let batch_axis = merge_axis(
                name,
                "batch",
                align(l.batch_axis, l.desc.shape.rank()),
                align(r.batch_axis, r.desc.shape.rank()),
            )?;
            let split_axis = merge_axis(
                name,
                "split",
                align(l.split_axis, l.desc.shape.rank()),
                align(r.split_axis, r.desc.shape.rank()),
            )?;
            let desc = BlobDesc {
                shape,
                data_type: l.desc.data_type,
                is_dynamic: l.desc.is_dynamic || r.desc.is_dynamic,
                is_tensor_list: false,
            };
            output(desc, batch_axis, split_axis)
        }
        OpKind::MatMul {
            transpose_a,
            transpose_b,
            ..
        } => {
            let (a, b) = (arg(name, inputs, 0)?, arg(name, inputs, 1)?);
            reject_tensor_list(name, a)?;
            reject_tensor_list(name, b)?;
            check_dtype(name, a.desc.data_type, b.desc.data_type)?;
            for x in [a, b] {
                if x.desc.shape.rank() != 2 {
                    return Err(invalid(
                        name,
                        format!("matmul expects rank-2 inputs, got {}", x.desc.shape),
                    ));
                }
            }
            let (ad, bd) = (a.desc.shape.dims(), b.desc.shape.dims());
            // (row axis, contracted axis) of each operand
            let (a_row, a_k) = if *transpose_a { (1, 0) } else { (0, 1) };
            let (b_k, b_col) = if *transpose_b { (1, 0) } else { (0, 1) };
            if ad[a_k] != bd[b_k] {
                return Err(Error::ShapeMismatch {
                    op: name.to_string(),
                    expected: Shape::from(vec![ad[a_row], ad[a_k]]),
                    got: Shape::from(vec![bd[b_k], bd[b_col]]),
                });
            }
            let shape = Shape::from((ad[a_row], bd[b_col]));
            let a_split = a.split_axis.map(|s| s as usize);
            let b_split = b.split_axis.map(|s| s as usize);
            if a_split == Some(a_k) || b_split == Some(b_k) {
                return Err(Error::SplitAxis {
                    op: name.to_string(),
                    reason: "contracting over a split axis is not supported".into(),
                });
            }
            let split_axis = merge_axis(
                name,
                "split",
                a_split.map(|_| 0),
                b_split.map(|_| 1),
            )?;
            let batch_axis = match a.batch_axis {
                Some(axis) if axis as usize == a_row => Some(0),
                _ => None,
            };
            let desc = BlobDesc {
                shape,
                data_type: a.desc.data_type,
                is_dynamic: a.desc.is_dynamic || b.desc.is_dynamic,
                is_tensor_list: false,
            };
            output(desc, batch_axis, split_axis)
        }
        OpKind::Reshape { shape, .. } => {
            let x = arg(name, inputs, 0)?;
            reject_tensor_list(name, x)?;
            let out = resolve_reshape(name, &x.desc.shape, shape)?;
            let keeps_leading = out.dim(0).is_some() && out.dim(0) == x.desc.shape.dim(0);
            let batch_axis = match x.batch_axis {
                Some(0) if keeps_leading => Some(0),
                _ => None,
            };
            let split_axis = match x.split_axis {
                None => None,
                Some(0) if keeps_leading => Some(0),
                Some(axis) => {
                    return Err(Error::SplitAxis {
                        op: name.to_string(),
                        reason: format!("reshape moves split axis {axis}"),
                    })
                }
            };
            let mut desc = x.desc.clone();
            desc.shape = out;
            output(desc, batch_axis, split_axis)
        }
        OpKind::ReduceSum {
            axes, keep_dims, ..
        } => {
            let x = arg(name, inputs, 0)?;
            reject_tensor_list(name, x)?;
            let rank = x.desc.shape.rank();
            let mut reduced = vec![false; rank];
            if axes.is_empty() {
                reduced.iter_mut().for_each(|r| *r = true);
            }
            for &axis in axes {
                let a = normalize_axis(name, axis, rank)?;
                reduced[a] = true;
            }
            if let Some(s) = x.split_axis {
                if reduced.get(s as usize).copied().unwrap_or(false) {
                    return Err(Error::SplitAxis {
                        op: name.to_string(),
                        reason: format!("reducing over split axis {s} is not supported"),
                    });
                }
            }
            // new index of every kept axis
            let remap = |axis: Option<i64>| -> Option<i64> {
                let a = axis? as usize;
                if reduced.get(a).copied().unwrap_or(true) {
                    return None;
                }
                if *keep_dims {
                    Some(a as i64)
                } else {
                    Some(reduced[..a].iter().filter(|r| !**r).count() as i64)
                }
            };
            let dims: Vec<usize> = x
                .desc
                .shape
                .dims()
                .iter()
                .zip(&reduced)
                .filter_map(|(&d, &r)| match (r, *keep_dims) {
                    (false, _) => Some(d),
                    (true, true) => Some(1),
                    (true, false) => None,
                })
                .collect();
            let mut desc = x.desc.clone();
            desc.shape = Shape::from(dims);
            output(desc, remap(x.batch_axis), remap(x.split_axis))
        }
    };

    attr.desc
        .shape
        .checked_elem_count()
        .map_err(|e| invalid(name, e.to_string()))?;
    if let Some(split) = attr.split_axis {
        let parallel_num = pc
            .parallel_num()
            .map_err(|e| placement(name, e.to_string()))?;
        let dim = attr.desc.shape.dim(split as usize).unwrap_or(0);
        if dim < parallel_num {
            return Err(Error::SplitAxis {
                op: name.to_string(),
                reason: format!(
                    "dim {dim} of split axis {split} is smaller than parallel num {parallel_num}"
                ),
            });
        }
    }
    Ok(attr)
}

fn invalid(op: &str, reason: impl Into<String>) -> Error {
    Error::InvalidOpConf {
        op: op.to_string(),
        reason: reason.into(),
    }
}

fn placement(op: &str, reason: impl Into<String>) -> Error {
    Error::Placement {
        op: op.to_string(),
        reason: reason.into(),
    }
}

fn arg<'a>(op: &str, inputs: &[&'a BlobAttr], index: usize) -> Result<&'a BlobAttr> {
    inputs
        .get(index)
        .copied()
        .ok_or_else(|| invalid(op, format!("missing input {index}")))
}

fn reject_tensor_list(op: &str, x: &BlobAttr) -> Result<()> {
    if x.desc.is_tensor_list {
        return Err(invalid(op, "tensor list inputs are only accepted by return ops"));
    }
    Ok(())
}

fn check_dtype(op: &str, expected: DType, got: DType) -> Result<()> {
    if expected != got {
        return Err(Error::DTypeMismatch {
            op: op.to_string(),
            expected,
            got,
        });
    }
    Ok(())
}

fn check_axis(op: &str, field: &str, axis: Option<i64>, rank: usize) -> Result<()> {
    match axis {
        Some(a) if a < 0 || a as usize >= rank => Err(invalid(
            op,
            format!("{field} {a} out of range for rank {rank}"),
        )),
        _ => Ok(()),
    }
}

fn normalize_axis(op: &str, axis: i64, rank: usize) -> Result<usize> {
    let a = if axis < 0 { axis + rank as i64 } else { axis };
    if a < 0 || a as usize >= rank {
        return Err(invalid(op, format!("axis {axis} out of range for rank {rank}")));
    }
    Ok(a as usize)
}

fn merge_axis(op: &str, what: &str, l: Option<i64>, r: Option<i64>) -> Result<Option<i64>> {
    match (l, r) {
        (Some(a), Some(b)) if a != b => Err(Error::SplitAxis {
            op: op.to_string(),
            reason: format!("inputs disagree on {what} axis: {a} vs {b}"),
        }),
        (Some(a), _) | (None, Some(a)) => Ok(Some(a)),
        (None, None) => Ok(None),
    }
}

fn resolve_reshape(op: &str, input: &Shape, target: &[i64]) -> Result<Shape> {
    let mut infer_at = None;
    let mut known = 1usize;
    for (i, &d) in target.iter().enumerate() {
        match d {
            -1 if infer_at.is_none() => infer_at = Some(i),
            -1 => return Err(invalid(op, "reshape allows at most one -1")),
            d if d <= 0 => return Err(invalid(op, format!("invalid reshape dim {d}"))),
            d => {
                known = known
                    .checked_mul(d as usize)
                    .ok_or_else(|| invalid(op, "reshape target has too many elements"))?
            }
        }
    }
    let mut dims: Vec<usize> = target.iter().map(|&d| d.max(0) as usize).collect();
    let total = input
        .checked_elem_count()
        .map_err(|e| invalid(op, e.to_string()))?;
    if let Some(i) = infer_at {
        if known == 0 || total % known != 0 {
            return Err(Error::ShapeMismatch {
                op: op.to_string(),
                expected: input.clone(),
                got: Shape::from(dims),
            });
        }
        dims[i] = total / known;
    }
    let out = Shape::from(dims);
    if out.checked_elem_count().ok() != Some(total) {
        return Err(Error::ShapeMismatch {
            op: op.to_string(),
            expected: input.clone(),
            got: out,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxflow_core::{BinaryOp, DeviceType, InterfaceBlobConf, UnaryOp};

    fn attr(dims: Vec<usize>, batch: Option<i64>, split: Option<i64>) -> BlobAttr {
        BlobAttr {
            desc: BlobDesc::new(Shape::from(dims), DType::F32),
            batch_axis: batch,
            split_axis: split,
            parallel_conf: ParallelConf::default(),
            disable_boxing: false,
        }
    }

    fn cpu() -> ParallelConf {
        ParallelConf::single(DeviceType::Cpu, 0, 0)
    }

    fn op(kind: OpKind) -> OperatorConf {
        OperatorConf::new("op", kind)
    }

    #[test]
    fn test_input() {
        let conf = op(OpKind::Input {
            blob: InterfaceBlobConf {
                shape: Shape::from((2, 3)),
                data_type: DType::F32,
                is_dynamic: false,
                is_tensor_list: false,
                batch_axis: Some(0),
                split_axis: Some(0),
            },
        });
        let out = infer_op(&conf, &cpu(), &[]).unwrap();
        assert_eq!(out.desc.shape, Shape::from((2, 3)));
        assert_eq!(out.split_axis, Some(0));
    }

    #[test]
    fn test_binary_broadcast_aligns_axes() {
        let conf = op(OpKind::Binary {
            op: BinaryOp::Add,
            lhs: "a/out".into(),
            rhs: "b/out".into(),
        });
        let a = attr(vec![4, 3], Some(0), None);
        let b = attr(vec![3], None, None);
        let out = infer_op(&conf, &cpu(), &[&a, &b]).unwrap();
        assert_eq!(out.desc.shape, Shape::from((4, 3)));
        assert_eq!(out.batch_axis, Some(0));

        let c = attr(vec![5], None, None);
        assert!(matches!(
            infer_op(&conf, &cpu(), &[&a, &c]),
            Err(Error::ShapeMismatch { .. })
        ));
        let mut d = attr(vec![4, 3], None, None);
        d.desc.data_type = DType::I32;
        assert!(matches!(
            infer_op(&conf, &cpu(), &[&a, &d]),
            Err(Error::DTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_matmul() {
        let conf = op(OpKind::MatMul {
            a: "a/out".into(),
            b: "b/out".into(),
            transpose_a: false,
            transpose_b: true,
        });
        let a = attr(vec![8, 4], Some(0), Some(0));
        let b = attr(vec![6, 4], None, None);
        let out = infer_op(&conf, &cpu(), &[&a, &b]).unwrap();
        assert_eq!(out.desc.shape, Shape::from((8, 6)));
        assert_eq!(out.batch_axis, Some(0));
        assert_eq!(out.split_axis, Some(0));

        let bad = attr(vec![6, 5], None, None);
        assert!(infer_op(&conf, &cpu(), &[&a, &bad]).is_err());
        let split_k = attr(vec![8, 4], None, Some(1));
        assert!(matches!(
            infer_op(&conf, &cpu(), &[&split_k, &b]),
            Err(Error::SplitAxis { .. })
        ));
    }

    #[test]
    fn test_reshape() {
        let conf = op(OpKind::Reshape {
            input: "x/out".into(),
            shape: vec![2, -1],
        });
        let x = attr(vec![2, 3, 4], Some(0), None);
        let out = infer_op(&conf, &cpu(), &[&x]).unwrap();
        assert_eq!(out.desc.shape, Shape::from((2, 12)));
        assert_eq!(out.batch_axis, Some(0));

        let two_holes = op(OpKind::Reshape {
            input: "x/out".into(),
            shape: vec![-1, -1],
        });
        assert!(infer_op(&two_holes, &cpu(), &[&x]).is_err());
        let wrong = op(OpKind::Reshape {
            input: "x/out".into(),
            shape: vec![5, -1],
        });
        assert!(matches!(
            infer_op(&wrong, &cpu(), &[&x]),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_oversized_outputs_are_rejected() {
        let huge = 1usize << 32;
        let input = op(OpKind::Input {
            blob: InterfaceBlobConf::new(Shape::from((huge, huge, 2)), DType::F32),
        });
        assert!(matches!(
            infer_op(&input, &cpu(), &[]),
            Err(Error::InvalidOpConf { .. })
        ));

        let add = op(OpKind::Binary {
            op: BinaryOp::Add,
            lhs: "a/out".into(),
            rhs: "b/out".into(),
        });
        let col = attr(vec![huge, 1], None, None);
        let row = attr(vec![1, huge], None, None);
        assert!(infer_op(&add, &cpu(), &[&col, &row]).is_err());

        let flatten = op(OpKind::Reshape {
            input: "x/out".into(),
            shape: vec![-1],
        });
        let x = attr(vec![huge, huge, 2], None, None);
        assert!(infer_op(&flatten, &cpu(), &[&x]).is_err());
        let blown_target = op(OpKind::Reshape {
            input: "x/out".into(),
            shape: vec![1 << 40, 1 << 40, -1],
        });
        let small = attr(vec![2, 3], None, None);
        assert!(infer_op(&blown_target, &cpu(), &[&small]).is_err());
    }

    #[test]
    fn test_reduce_sum_renumbers_axes() {
        let conf = op(OpKind::ReduceSum {
            input: "x/out".into(),
            axes: vec![1],
            keep_dims: false,
        });
        let x = attr(vec![2, 3, 4], None, Some(2));
        let out = infer_op(&conf, &cpu(), &[&x]).unwrap();
        assert_eq!(out.desc.shape, Shape::from((2, 4)));
        assert_eq!(out.split_axis, Some(1));

        let over_split = op(OpKind::ReduceSum {
            input: "x/out".into(),
            axes: vec![-1],
            keep_dims: true,
        });
        assert!(matches!(
            infer_op(&over_split, &cpu(), &[&x]),
            Err(Error::SplitAxis { .. })
        ));
    }

    #[test]
    fn test_unary_keeps_attrs() {
        let conf = op(OpKind::Unary {
            op: UnaryOp::Relu,
            input: "x/out".into(),
        });
        let x = attr(vec![2, 3], Some(0), None);
        let out = infer_op(&conf, &cpu(), &[&x]).unwrap();
        assert_eq!(out.desc, x.desc);
        assert_eq!(out.batch_axis, Some(0));
        assert_eq!(out.split_axis, None);
    }

    #[test]
    fn test_split_smaller_than_parallel_num() {
        let pc = ParallelConf::new("cpu", vec!["0:0-3".into()]);
        let conf = op(OpKind::Variable {
            shape: Shape::from((2, 8)),
            data_type: DType::F32,
            split_axis: Some(0),
        });
        assert!(matches!(
            infer_op(&conf, &pc, &[]),
            Err(Error::SplitAxis { .. })
        ));
    }
}
