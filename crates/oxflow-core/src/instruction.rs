// VM instruction schema
//
// An instruction batch is an InstructionList plus an EagerSymbolList that
// defines the symbols the batch references. Both travel as structured text:
//
//   instruction {
//     instr_type_name: "NewSymbol"
//     operand { int64_operand: 3 }
//     operand { int64_operand: 1 }
//   }
//
//   eager_symbol { symbol_id: 5 parallel_conf_symbol { device_tag: "cpu" device_name: "0:0" } }
//
// Operands reference symbols (immutable, defined by an EagerSymbol),
// objects (mutable runtime state, addressed by logical object id and a
// parallel selector) or carry plain scalars.

use crate::error::{Error, Result};
use crate::job::JobConfig;
use crate::op_conf::OperatorConf;
use crate::placement::ParallelConf;
use crate::text_format::{TextMessage, TextNode};

/// Which per-rank copies of a logical object an operand touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelSelector {
    AllMirrored,
    CurrentGlobalDevice,
    MirroredId(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// Reads a previously defined symbol.
    Symbol(i64),
    /// Initialises the symbol with this id from the batch's symbol list.
    InitSymbol(i64),
    Object {
        logical_object_id: i64,
        parallel: ParallelSelector,
        mutable: bool,
    },
    Int64(i64),
    Uint64(u64),
    Bool(bool),
    Separator,
}

impl TextMessage for Operand {
    fn to_node(&self) -> TextNode {
        let mut node = TextNode::new();
        match self {
            Operand::Symbol(id) => {
                let mut inner = TextNode::new();
                inner.int("logical_object_id", *id);
                node.message("symbol_operand", inner);
            }
            Operand::InitSymbol(id) => {
                let mut inner = TextNode::new();
                inner.int("logical_object_id", *id);
                node.message("init_symbol_operand", inner);
            }
            Operand::Object {
                logical_object_id,
                parallel,
                mutable,
            } => {
                let mut inner = TextNode::new();
                inner.int("logical_object_id", *logical_object_id);
                match parallel {
                    ParallelSelector::AllMirrored => {
                        inner.message("all_mirrored_object", TextNode::new());
                    }
                    ParallelSelector::CurrentGlobalDevice => {
                        inner.message("current_global_device_id", TextNode::new());
                    }
                    ParallelSelector::MirroredId(i) => {
                        inner.int("mirrored_object_id", *i);
                    }
                }
                node.message(if *mutable { "mut_operand" } else { "const_operand" }, inner);
            }
            Operand::Int64(v) => {
                node.int("int64_operand", *v);
            }
            Operand::Uint64(v) => {
                node.int("uint64_operand", *v as i64);
            }
            Operand::Bool(v) => {
                node.bool("bool_operand", *v);
            }
            Operand::Separator => {
                node.message("separator", TextNode::new());
            }
        }
        node
    }

    fn from_node(node: &TextNode) -> Result<Self> {
        let (field, _) = node
            .fields()
            .first()
            .ok_or_else(|| Error::schema("operand", "empty operand"))?;
        Ok(match field.as_str() {
            "symbol_operand" => {
                Operand::Symbol(node.req_message(field)?.req_int("logical_object_id")?)
            }
            "init_symbol_operand" => {
                Operand::InitSymbol(node.req_message(field)?.req_int("logical_object_id")?)
            }
            "mut_operand" | "const_operand" => {
                let inner = node.req_message(field)?;
                let parallel = if inner.has("all_mirrored_object") {
                    ParallelSelector::AllMirrored
                } else if inner.has("current_global_device_id") {
                    ParallelSelector::CurrentGlobalDevice
                } else {
                    ParallelSelector::MirroredId(inner.req_int("mirrored_object_id")?)
                };
                Operand::Object {
                    logical_object_id: inner.req_int("logical_object_id")?,
                    parallel,
                    mutable: field == "mut_operand",
                }
            }
            "int64_operand" => Operand::Int64(node.req_int(field)?),
            "uint64_operand" => {
                let v = node.req_int(field)?;
                if v < 0 {
                    return Err(Error::schema(field, "negative uint64"));
                }
                Operand::Uint64(v as u64)
            }
            "bool_operand" => Operand::Bool(node.bool_or(field, false)?),
            "separator" => Operand::Separator,
            other => return Err(Error::schema(other, "unknown operand kind")),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionProto {
    pub instr_type_name: String,
    pub parallel_desc_symbol_id: Option<i64>,
    pub operands: Vec<Operand>,
}

impl InstructionProto {
    pub fn new(instr_type_name: impl Into<String>) -> Self {
        Self {
            instr_type_name: instr_type_name.into(),
            parallel_desc_symbol_id: None,
            operands: Vec::new(),
        }
    }

    pub fn with_parallel_desc(mut self, symbol_id: i64) -> Self {
        self.parallel_desc_symbol_id = Some(symbol_id);
        self
    }

    pub fn with_operand(mut self, operand: Operand) -> Self {
        self.operands.push(operand);
        self
    }

    /// Symbol ids this instruction reads.
    pub fn symbol_refs(&self) -> impl Iterator<Item = i64> + '_ {
        self.parallel_desc_symbol_id
            .into_iter()
            .chain(self.operands.iter().filter_map(|o| match o {
                Operand::Symbol(id) | Operand::InitSymbol(id) => Some(*id),
                _ => None,
            }))
    }
}

impl TextMessage for InstructionProto {
    fn to_node(&self) -> TextNode {
        let mut node = TextNode::new();
        node.str("instr_type_name", &self.instr_type_name);
        if let Some(id) = self.parallel_desc_symbol_id {
            node.int("parallel_desc_symbol_id", id);
        }
        for operand in &self.operands {
            node.message("operand", operand.to_node());
        }
        node
    }

    fn from_node(node: &TextNode) -> Result<Self> {
        Ok(Self {
            instr_type_name: node.req_str("instr_type_name")?,
            parallel_desc_symbol_id: node.get_int("parallel_desc_symbol_id")?,
            operands: node
                .messages("operand")?
                .into_iter()
                .map(Operand::from_node)
                .collect::<Result<Vec<_>>>()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstructionList {
    pub instructions: Vec<InstructionProto>,
}

impl InstructionList {
    pub fn new(instructions: Vec<InstructionProto>) -> Self {
        Self { instructions }
    }
}

impl TextMessage for InstructionList {
    fn to_node(&self) -> TextNode {
        let mut node = TextNode::new();
        for instr in &self.instructions {
            node.message("instruction", instr.to_node());
        }
        node
    }

    fn from_node(node: &TextNode) -> Result<Self> {
        Ok(Self {
            instructions: node
                .messages("instruction")?
                .into_iter()
                .map(InstructionProto::from_node)
                .collect::<Result<Vec<_>>>()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolPayload {
    String(String),
    ParallelConf(ParallelConf),
    JobConf(JobConfig),
    OpConf(OperatorConf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EagerSymbol {
    pub symbol_id: i64,
    pub payload: SymbolPayload,
}

impl TextMessage for EagerSymbol {
    fn to_node(&self) -> TextNode {
        let mut node = TextNode::new();
        node.int("symbol_id", self.symbol_id);
        match &self.payload {
            SymbolPayload::String(s) => node.str("string_symbol", s),
            SymbolPayload::ParallelConf(pc) => node.message("parallel_conf_symbol", pc.to_node()),
            SymbolPayload::JobConf(jc) => node.message("job_conf_symbol", jc.to_node()),
            SymbolPayload::OpConf(op) => node.message("op_conf_symbol", op.to_node()),
        };
        node
    }

    fn from_node(node: &TextNode) -> Result<Self> {
        let payload = if let Some(s) = node.get_str("string_symbol")? {
            SymbolPayload::String(s.to_string())
        } else if let Some(pc) = node.get_message("parallel_conf_symbol")? {
            SymbolPayload::ParallelConf(ParallelConf::from_node(pc)?)
        } else if let Some(jc) = node.get_message("job_conf_symbol")? {
            SymbolPayload::JobConf(JobConfig::from_node(jc)?)
        } else if let Some(op) = node.get_message("op_conf_symbol")? {
            SymbolPayload::OpConf(OperatorConf::from_node(op)?)
        } else {
            return Err(Error::schema("eager_symbol", "symbol has no payload"));
        };
        Ok(Self {
            symbol_id: node.req_int("symbol_id")?,
            payload,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EagerSymbolList {
    pub symbols: Vec<EagerSymbol>,
}

impl TextMessage for EagerSymbolList {
    fn to_node(&self) -> TextNode {
        let mut node = TextNode::new();
        for symbol in &self.symbols {
            node.message("eager_symbol", symbol.to_node());
        }
        node
    }

    fn from_node(node: &TextNode) -> Result<Self> {
        Ok(Self {
            symbols: node
                .messages("eager_symbol")?
                .into_iter()
                .map(EagerSymbol::from_node)
                .collect::<Result<Vec<_>>>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruction_list_text() {
        let list = InstructionList::new(vec![
            InstructionProto::new("NewSymbol")
                .with_operand(Operand::Int64(3))
                .with_operand(Operand::Int64(1)),
            InstructionProto::new("relu")
                .with_parallel_desc(5)
                .with_operand(Operand::Symbol(6))
                .with_operand(Operand::Separator)
                .with_operand(Operand::Object {
                    logical_object_id: 3,
                    parallel: ParallelSelector::AllMirrored,
                    mutable: true,
                })
                .with_operand(Operand::Object {
                    logical_object_id: 4,
                    parallel: ParallelSelector::MirroredId(1),
                    mutable: false,
                })
                .with_operand(Operand::Uint64(9))
                .with_operand(Operand::Bool(true)),
        ]);
        assert_eq!(InstructionList::from_text(&list.to_text()).unwrap(), list);
        let refs: Vec<i64> = list.instructions[1].symbol_refs().collect();
        assert_eq!(refs, vec![5, 6]);
    }

    #[test]
    fn test_symbol_list_text() {
        let list = EagerSymbolList {
            symbols: vec![
                EagerSymbol {
                    symbol_id: 5,
                    payload: SymbolPayload::ParallelConf(ParallelConf::default()),
                },
                EagerSymbol {
                    symbol_id: 6,
                    payload: SymbolPayload::String("relu".into()),
                },
            ],
        };
        assert_eq!(EagerSymbolList::from_text(&list.to_text()).unwrap(), list);
        assert!(EagerSymbol::from_text("symbol_id: 1").is_err());
    }
}
