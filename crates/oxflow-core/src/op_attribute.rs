// Inferred attributes
//
// Produced exclusively by the job context when an operator is added, and
// read-only everywhere else. BlobAttr is what the blob query family
// answers from; OpAttribute is what AddAndInfer*Op returns.

use crate::dtype::DType;
use crate::error::Result;
use crate::lbi::LogicalBlobId;
use crate::op_conf::OperatorConf;
use crate::placement::ParallelConf;
use crate::shape::Shape;
use crate::text_format::{TextMessage, TextNode};

/// Static shape and type of one blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobDesc {
    pub shape: Shape,
    pub data_type: DType,
    pub is_dynamic: bool,
    pub is_tensor_list: bool,
}

impl BlobDesc {
    pub fn new(shape: Shape, data_type: DType) -> Self {
        Self {
            shape,
            data_type,
            is_dynamic: false,
            is_tensor_list: false,
        }
    }
}

impl TextMessage for BlobDesc {
    fn to_node(&self) -> TextNode {
        let mut node = TextNode::new();
        node.message("shape", self.shape.to_node())
            .ident("data_type", self.data_type.name())
            .bool("is_dynamic", self.is_dynamic)
            .bool("is_tensor_list", self.is_tensor_list);
        node
    }

    fn from_node(node: &TextNode) -> Result<Self> {
        Ok(Self {
            shape: Shape::from_node(node.req_message("shape")?)?,
            data_type: DType::from_name(node.req_ident("data_type")?)?,
            is_dynamic: node.bool_or("is_dynamic", false)?,
            is_tensor_list: node.bool_or("is_tensor_list", false)?,
        })
    }
}

/// Everything inferred about one logical blob, from its producer's view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobAttr {
    pub desc: BlobDesc,
    pub batch_axis: Option<i64>,
    pub split_axis: Option<i64>,
    pub parallel_conf: ParallelConf,
    pub disable_boxing: bool,
}

impl TextMessage for BlobAttr {
    fn to_node(&self) -> TextNode {
        let mut node = TextNode::new();
        node.message("blob_desc", self.desc.to_node())
            .set_opt_int("batch_axis", self.batch_axis)
            .set_opt_int("split_axis", self.split_axis)
            .message("parallel_conf", self.parallel_conf.to_node())
            .bool("disable_boxing", self.disable_boxing);
        node
    }

    fn from_node(node: &TextNode) -> Result<Self> {
        Ok(Self {
            desc: BlobDesc::from_node(node.req_message("blob_desc")?)?,
            batch_axis: node.opt_int("batch_axis")?,
            split_axis: node.opt_int("split_axis")?,
            parallel_conf: ParallelConf::from_node(node.req_message("parallel_conf")?)?,
            disable_boxing: node.bool_or("disable_boxing", false)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputAttr {
    pub bn: String,
    pub lbi: LogicalBlobId,
    pub attr: BlobAttr,
}

/// Result of adding one operator to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpAttribute {
    /// The completed conf, placement filled in.
    pub op_conf: OperatorConf,
    pub input_lbis: Vec<LogicalBlobId>,
    pub outputs: Vec<OutputAttr>,
    pub is_mirrored: bool,
}

impl OpAttribute {
    pub fn output(&self, bn: &str) -> Option<&BlobAttr> {
        self.outputs.iter().find(|o| o.bn == bn).map(|o| &o.attr)
    }
}

impl TextMessage for OpAttribute {
    fn to_node(&self) -> TextNode {
        let mut node = TextNode::new();
        node.message("op_conf", self.op_conf.to_node());
        for lbi in &self.input_lbis {
            node.message("input_lbi", lbi.to_node());
        }
        for out in &self.outputs {
            let mut entry = TextNode::new();
            entry
                .str("bn", &out.bn)
                .message("lbi", out.lbi.to_node())
                .message("attr", out.attr.to_node());
            node.message("output", entry);
        }
        node.bool("is_mirrored", self.is_mirrored);
        node
    }

    fn from_node(node: &TextNode) -> Result<Self> {
        let input_lbis = node
            .messages("input_lbi")?
            .into_iter()
            .map(LogicalBlobId::from_node)
            .collect::<Result<Vec<_>>>()?;
        let outputs = node
            .messages("output")?
            .into_iter()
            .map(|o| {
                Ok(OutputAttr {
                    bn: o.req_str("bn")?,
                    lbi: LogicalBlobId::from_node(o.req_message("lbi")?)?,
                    attr: BlobAttr::from_node(o.req_message("attr")?)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            op_conf: OperatorConf::from_node(node.req_message("op_conf")?)?,
            input_lbis,
            outputs,
            is_mirrored: node.bool_or("is_mirrored", false)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op_conf::{OpKind, UnaryOp};

    #[test]
    fn test_op_attribute_text() {
        let attr = OpAttribute {
            op_conf: OperatorConf::new(
                "relu",
                OpKind::Unary {
                    op: UnaryOp::Relu,
                    input: "x/out".into(),
                },
            )
            .with_parallel_conf(ParallelConf::default()),
            input_lbis: vec![LogicalBlobId::new("x", "out")],
            outputs: vec![OutputAttr {
                bn: "out".into(),
                lbi: LogicalBlobId::new("relu", "out"),
                attr: BlobAttr {
                    desc: BlobDesc::new(Shape::from((4, 3)), DType::F32),
                    batch_axis: Some(0),
                    split_axis: None,
                    parallel_conf: ParallelConf::default(),
                    disable_boxing: false,
                },
            }],
            is_mirrored: false,
        };
        let decoded = OpAttribute::from_text(&attr.to_text()).unwrap();
        assert_eq!(decoded, attr);
        assert_eq!(decoded.output("out").unwrap().split_axis, None);
        assert!(decoded.output("in").is_none());
    }
}
