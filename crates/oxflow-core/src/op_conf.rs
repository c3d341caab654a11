// OperatorConf - user-declared operators
//
// An operator conf is the immutable declaration submitted to a job context:
// a unique name, an optional placement and a typed kind. The kind is a
// closed set of built-in operators, each with a single output blob `out`
// and its own inference rule in the engine.
//
//   Input     - placeholder fed by the push path, described by InterfaceBlobConf
//   Return    - marks a blob as job output (pulled after the job runs)
//   Variable  - model blob, initialised and saved by system jobs
//   Unary     - elementwise identity / relu / sigmoid / tanh / neg
//   Cast      - elementwise dtype conversion
//   Binary    - elementwise add / sub / mul / div with broadcasting
//   MatMul    - 2-D matrix multiply with optional transposes
//   Reshape   - static reshape, one dim may be -1
//   ReduceSum - sum over axes, optionally keeping reduced dims
//
// In structured text the kind is a oneof spelled `<kind>_conf { ... }`:
//
//   name: "relu1"
//   unary_conf { op: relu in: "input/out" }

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::lbi::LogicalBlobId;
use crate::placement::ParallelConf;
use crate::shape::Shape;
use crate::text_format::{TextMessage, TextNode};

/// Output blob name shared by every built-in operator.
pub const OUTPUT_BN: &str = "out";

/// Wire-level description of a placeholder blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceBlobConf {
    pub shape: Shape,
    pub data_type: DType,
    pub is_dynamic: bool,
    pub is_tensor_list: bool,
    pub batch_axis: Option<i64>,
    pub split_axis: Option<i64>,
}

impl InterfaceBlobConf {
    /// A static blob with no batch or split axis.
    pub fn new(shape: Shape, data_type: DType) -> Self {
        Self {
            shape,
            data_type,
            is_dynamic: false,
            is_tensor_list: false,
            batch_axis: None,
            split_axis: None,
        }
    }
}

impl TextMessage for InterfaceBlobConf {
    fn to_node(&self) -> TextNode {
        let mut node = TextNode::new();
        node.message("shape", self.shape.to_node())
            .ident("data_type", self.data_type.name())
            .bool("is_dynamic", self.is_dynamic)
            .bool("is_tensor_list", self.is_tensor_list)
            .set_opt_int("batch_axis", self.batch_axis)
            .set_opt_int("split_axis", self.split_axis);
        node
    }

    fn from_node(node: &TextNode) -> Result<Self> {
        Ok(Self {
            shape: Shape::from_node(node.req_message("shape")?)?,
            data_type: DType::from_name(node.req_ident("data_type")?)?,
            is_dynamic: node.bool_or("is_dynamic", false)?,
            is_tensor_list: node.bool_or("is_tensor_list", false)?,
            batch_axis: node.opt_int("batch_axis")?,
            split_axis: node.opt_int("split_axis")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Identity,
    Relu,
    Sigmoid,
    Tanh,
    Neg,
}

impl UnaryOp {
    pub fn name(&self) -> &'static str {
        match self {
            UnaryOp::Identity => "identity",
            UnaryOp::Relu => "relu",
            UnaryOp::Sigmoid => "sigmoid",
            UnaryOp::Tanh => "tanh",
            UnaryOp::Neg => "neg",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        Ok(match name {
            "identity" => UnaryOp::Identity,
            "relu" => UnaryOp::Relu,
            "sigmoid" => UnaryOp::Sigmoid,
            "tanh" => UnaryOp::Tanh,
            "neg" => UnaryOp::Neg,
            other => return Err(Error::schema("op", format!("unknown unary op '{other}'"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn name(&self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        Ok(match name {
            "add" => BinaryOp::Add,
            "sub" => BinaryOp::Sub,
            "mul" => BinaryOp::Mul,
            "div" => BinaryOp::Div,
            other => return Err(Error::schema("op", format!("unknown binary op '{other}'"))),
        })
    }
}

/// Typed operator kind. Inputs are logical blob names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpKind {
    Input {
        blob: InterfaceBlobConf,
    },
    Return {
        input: String,
    },
    Variable {
        shape: Shape,
        data_type: DType,
        split_axis: Option<i64>,
    },
    Unary {
        op: UnaryOp,
        input: String,
    },
    Cast {
        input: String,
        data_type: DType,
    },
    Binary {
        op: BinaryOp,
        lhs: String,
        rhs: String,
    },
    MatMul {
        a: String,
        b: String,
        transpose_a: bool,
        transpose_b: bool,
    },
    Reshape {
        input: String,
        shape: Vec<i64>,
    },
    ReduceSum {
        input: String,
        axes: Vec<i64>,
        keep_dims: bool,
    },
}

impl OpKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            OpKind::Input { .. } => "input",
            OpKind::Return { .. } => "return",
            OpKind::Variable { .. } => "variable",
            OpKind::Unary { .. } => "unary",
            OpKind::Cast { .. } => "cast",
            OpKind::Binary { .. } => "binary",
            OpKind::MatMul { .. } => "matmul",
            OpKind::Reshape { .. } => "reshape",
            OpKind::ReduceSum { .. } => "reduce_sum",
        }
    }

    fn inputs(&self) -> Vec<&String> {
        match self {
            OpKind::Input { .. } | OpKind::Variable { .. } => vec![],
            OpKind::Return { input }
            | OpKind::Unary { input, .. }
            | OpKind::Cast { input, .. }
            | OpKind::Reshape { input, .. }
            | OpKind::ReduceSum { input, .. } => vec![input],
            OpKind::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            OpKind::MatMul { a, b, .. } => vec![a, b],
        }
    }

    fn inputs_mut(&mut self) -> Vec<&mut String> {
        match self {
            OpKind::Input { .. } | OpKind::Variable { .. } => vec![],
            OpKind::Return { input }
            | OpKind::Unary { input, .. }
            | OpKind::Cast { input, .. }
            | OpKind::Reshape { input, .. }
            | OpKind::ReduceSum { input, .. } => vec![input],
            OpKind::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            OpKind::MatMul { a, b, .. } => vec![a, b],
        }
    }
}

/// A declared operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConf {
    pub name: String,
    /// Filled from the job's default placement when absent.
    pub parallel_conf: Option<ParallelConf>,
    pub kind: OpKind,
}

impl OperatorConf {
    pub fn new(name: impl Into<String>, kind: OpKind) -> Self {
        Self {
            name: name.into(),
            parallel_conf: None,
            kind,
        }
    }

    pub fn with_parallel_conf(mut self, parallel_conf: ParallelConf) -> Self {
        self.parallel_conf = Some(parallel_conf);
        self
    }

    pub fn input(name: impl Into<String>, blob: InterfaceBlobConf) -> Self {
        Self::new(name, OpKind::Input { blob })
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    /// Logical blob names this op consumes, in argument order.
    pub fn input_lbns(&self) -> Vec<&str> {
        self.kind.inputs().into_iter().map(String::as_str).collect()
    }

    pub fn output_lbi(&self) -> LogicalBlobId {
        LogicalBlobId::new(self.name.clone(), OUTPUT_BN)
    }

    /// Copy with a new name and every input lbn rewritten by `f`.
    pub fn remapped(&self, name: impl Into<String>, mut f: impl FnMut(&str) -> String) -> Self {
        let mut out = self.clone();
        out.name = name.into();
        for input in out.kind.inputs_mut() {
            *input = f(input);
        }
        out
    }
}

impl TextMessage for OperatorConf {
    fn to_node(&self) -> TextNode {
        let mut node = TextNode::new();
        node.str("name", &self.name);
        if let Some(pc) = &self.parallel_conf {
            node.message("parallel_conf", pc.to_node());
        }
        let mut body = TextNode::new();
        match &self.kind {
            OpKind::Input { blob } => {
                body.message("blob_conf", blob.to_node());
            }
            OpKind::Return { input } => {
                body.str("in", input);
            }
            OpKind::Variable {
                shape,
                data_type,
                split_axis,
            } => {
                body.message("shape", shape.to_node())
                    .ident("data_type", data_type.name())
                    .set_opt_int("split_axis", *split_axis);
            }
            OpKind::Unary { op, input } => {
                body.ident("op", op.name()).str("in", input);
            }
            OpKind::Cast { input, data_type } => {
                body.str("in", input).ident("data_type", data_type.name());
            }
            OpKind::Binary { op, lhs, rhs } => {
                body.ident("op", op.name()).str("lhs", lhs).str("rhs", rhs);
            }
            OpKind::MatMul {
                a,
                b,
                transpose_a,
                transpose_b,
            } => {
                body.str("a", a)
                    .str("b", b)
                    .bool("transpose_a", *transpose_a)
                    .bool("transpose_b", *transpose_b);
            }
            OpKind::Reshape { input, shape } => {
                body.str("in", input)
                    .message("shape", {
                        let mut s = TextNode::new();
                        s.set_ints("dim", shape.iter().copied());
                        s
                    });
            }
            OpKind::ReduceSum {
                input,
                axes,
                keep_dims,
            } => {
                body.str("in", input)
                    .set_ints("axis", axes.iter().copied())
                    .bool("keep_dims", *keep_dims);
            }
        }
        node.message(&format!("{}_conf", self.kind.type_name()), body);
        node
    }

    fn from_node(node: &TextNode) -> Result<Self> {
        let name = node.req_str("name")?;
        let parallel_conf = node
            .get_message("parallel_conf")?
            .map(ParallelConf::from_node)
            .transpose()?;

        let mut kinds = node
            .fields()
            .iter()
            .filter(|(field, _)| field.ends_with("_conf") && field != "parallel_conf");
        let (field, _) = kinds
            .next()
            .ok_or_else(|| Error::schema("op_type", format!("op '{name}' has no kind")))?;
        if kinds.next().is_some() {
            return Err(Error::schema("op_type", format!("op '{name}' sets more than one kind")));
        }
        let body = node.req_message(field)?;
        let kind = match field.as_str() {
            "input_conf" => OpKind::Input {
                blob: InterfaceBlobConf::from_node(body.req_message("blob_conf")?)?,
            },
            "return_conf" => OpKind::Return {
                input: body.req_str("in")?,
            },
            "variable_conf" => OpKind::Variable {
                shape: Shape::from_node(body.req_message("shape")?)?,
                data_type: DType::from_name(body.req_ident("data_type")?)?,
                split_axis: body.opt_int("split_axis")?,
            },
            "unary_conf" => OpKind::Unary {
                op: UnaryOp::from_name(body.req_ident("op")?)?,
                input: body.req_str("in")?,
            },
            "cast_conf" => OpKind::Cast {
                input: body.req_str("in")?,
                data_type: DType::from_name(body.req_ident("data_type")?)?,
            },
            "binary_conf" => OpKind::Binary {
                op: BinaryOp::from_name(body.req_ident("op")?)?,
                lhs: body.req_str("lhs")?,
                rhs: body.req_str("rhs")?,
            },
            "matmul_conf" => OpKind::MatMul {
                a: body.req_str("a")?,
                b: body.req_str("b")?,
                transpose_a: body.bool_or("transpose_a", false)?,
                transpose_b: body.bool_or("transpose_b", false)?,
            },
            "reshape_conf" => OpKind::Reshape {
                input: body.req_str("in")?,
                shape: body.req_message("shape")?.ints("dim")?,
            },
            "reduce_sum_conf" => OpKind::ReduceSum {
                input: body.req_str("in")?,
                axes: body.ints("axis")?,
                keep_dims: body.bool_or("keep_dims", false)?,
            },
            other => {
                return Err(Error::schema("op_type", format!("unknown op kind '{other}'")))
            }
        };
        Ok(Self {
            name,
            parallel_conf,
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob() -> InterfaceBlobConf {
        InterfaceBlobConf {
            shape: Shape::from((2, 3)),
            data_type: DType::F32,
            is_dynamic: true,
            is_tensor_list: false,
            batch_axis: Some(0),
            split_axis: None,
        }
    }

    #[test]
    fn test_interface_blob_conf_keeps_unset_axes() {
        let decoded = InterfaceBlobConf::from_text(&blob().to_text()).unwrap();
        assert_eq!(decoded, blob());
        assert_eq!(decoded.split_axis, None);
    }

    #[test]
    fn test_op_conf_text() {
        let ops = [
            OperatorConf::input("x", blob()).with_parallel_conf(ParallelConf::default()),
            OperatorConf::new(
                "y",
                OpKind::Binary {
                    op: BinaryOp::Mul,
                    lhs: "x/out".into(),
                    rhs: "w/out".into(),
                },
            ),
            OperatorConf::new(
                "r",
                OpKind::Reshape {
                    input: "y/out".into(),
                    shape: vec![-1, 3],
                },
            ),
            OperatorConf::new(
                "s",
                OpKind::ReduceSum {
                    input: "r/out".into(),
                    axes: vec![0],
                    keep_dims: true,
                },
            ),
        ];
        for op in ops {
            assert_eq!(OperatorConf::from_text(&op.to_text()).unwrap(), op);
        }
    }

    #[test]
    fn test_parse_handwritten() {
        let op = OperatorConf::from_text(r#"name: "relu1" unary_conf { op: relu in: "x/out" }"#)
            .unwrap();
        assert_eq!(op.input_lbns(), vec!["x/out"]);
        assert_eq!(op.output_lbi().lbn(), "relu1/out");
        assert!(OperatorConf::from_text(r#"name: "a""#).is_err());
        assert!(OperatorConf::from_text(r#"name: "a" foo_conf { }"#).is_err());
    }

    #[test]
    fn test_remapped() {
        let op = OperatorConf::new(
            "mm",
            OpKind::MatMul {
                a: "x/out".into(),
                b: "w/out".into(),
                transpose_a: false,
                transpose_b: true,
            },
        );
        let sub = op.remapped("mm_0", |lbn| format!("{lbn}_0"));
        assert_eq!(sub.name, "mm_0");
        assert_eq!(sub.input_lbns(), vec!["x/out_0", "w/out_0"]);
    }
}
