use std::fmt;

use crate::error::{Error, Result};
use crate::text_format::{TextMessage, TextNode};

/// Name of one output of one operator: `(op_name, blob_name)`.
///
/// The textual form, the logical blob name (lbn), is `"op_name/blob_name"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalBlobId {
    pub op_name: String,
    pub blob_name: String,
}

impl LogicalBlobId {
    pub fn new(op_name: impl Into<String>, blob_name: impl Into<String>) -> Self {
        Self {
            op_name: op_name.into(),
            blob_name: blob_name.into(),
        }
    }

    pub fn lbn(&self) -> String {
        format!("{}/{}", self.op_name, self.blob_name)
    }

    /// Split an lbn at its only `/`. Both halves must be non-empty.
    pub fn parse(lbn: &str) -> Result<Self> {
        match lbn.split_once('/') {
            Some((op, blob)) if !op.is_empty() && !blob.is_empty() && !blob.contains('/') => {
                Ok(Self::new(op, blob))
            }
            _ => Err(Error::InvalidLbn(lbn.to_string())),
        }
    }
}

impl fmt::Display for LogicalBlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.op_name, self.blob_name)
    }
}

impl TextMessage for LogicalBlobId {
    fn to_node(&self) -> TextNode {
        let mut node = TextNode::new();
        node.str("op_name", &self.op_name)
            .str("blob_name", &self.blob_name);
        node
    }

    fn from_node(node: &TextNode) -> Result<Self> {
        Ok(Self {
            op_name: node.req_str("op_name")?,
            blob_name: node.req_str("blob_name")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let lbi = LogicalBlobId::parse("op1/out").unwrap();
        assert_eq!(lbi, LogicalBlobId::new("op1", "out"));
        assert_eq!(lbi.lbn(), "op1/out");
        for bad in ["op1", "/out", "op1/", "a/b/c", ""] {
            assert!(matches!(LogicalBlobId::parse(bad), Err(Error::InvalidLbn(_))));
        }
    }
}
