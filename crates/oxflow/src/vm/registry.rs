// Instruction registry
//
// Control instructions manage the VM's object and symbol tables and exist in
// two spellings, one per flavour:
//
//   logical    NewObject       DeleteObject       NewSymbol       DeleteSymbol       InitSymbol
//   physical   LocalNewObject  LocalDeleteObject  LocalNewSymbol  LocalDeleteSymbol  LocalInitSymbol
//
// Every other name is a compute instruction, forwarded to the handler, and
// may appear in either flavour.

use std::fmt;

use crate::{Error, Result};

/// Logical (whole-graph, cross machine) or physical (single rank) batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flavour {
    Logical,
    Physical,
}

impl Flavour {
    pub fn name(&self) -> &'static str {
        match self {
            Flavour::Logical => "logical",
            Flavour::Physical => "physical",
        }
    }
}

impl fmt::Display for Flavour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    NewObject,
    DeleteObject,
    NewSymbol,
    DeleteSymbol,
    InitSymbol,
}

const CONTROL_OPS: [(&str, ControlOp); 5] = [
    ("NewObject", ControlOp::NewObject),
    ("DeleteObject", ControlOp::DeleteObject),
    ("NewSymbol", ControlOp::NewSymbol),
    ("DeleteSymbol", ControlOp::DeleteSymbol),
    ("InitSymbol", ControlOp::InitSymbol),
];

const PHYSICAL_PREFIX: &str = "Local";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrKind {
    Control(ControlOp),
    Compute,
}

fn lookup_control(name: &str) -> Option<(ControlOp, Flavour)> {
    let (base, flavour) = match name.strip_prefix(PHYSICAL_PREFIX) {
        Some(base) => (base, Flavour::Physical),
        None => (name, Flavour::Logical),
    };
    CONTROL_OPS
        .iter()
        .find(|(n, _)| *n == base)
        .map(|(_, op)| (*op, flavour))
}

/// Classify `name` for a batch of the given flavour.
pub fn classify(name: &str, flavour: Flavour) -> Result<InstrKind> {
    if name.is_empty() {
        return Err(Error::Dispatch("instruction name must not be empty".into()));
    }
    match lookup_control(name) {
        Some((op, f)) if f == flavour => Ok(InstrKind::Control(op)),
        Some((_, f)) => Err(Error::Dispatch(format!(
            "{f} instruction '{name}' submitted in a {flavour} batch"
        ))),
        None => Ok(InstrKind::Compute),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("NewObject", Flavour::Logical, InstrKind::Control(ControlOp::NewObject))]
    #[case("LocalNewSymbol", Flavour::Physical, InstrKind::Control(ControlOp::NewSymbol))]
    #[case("LocalInitSymbol", Flavour::Physical, InstrKind::Control(ControlOp::InitSymbol))]
    #[case("relu", Flavour::Logical, InstrKind::Compute)]
    #[case("relu", Flavour::Physical, InstrKind::Compute)]
    fn test_classify(#[case] name: &str, #[case] flavour: Flavour, #[case] kind: InstrKind) {
        assert_eq!(classify(name, flavour).unwrap(), kind);
    }

    #[rstest]
    #[case("", Flavour::Logical)]
    #[case("NewObject", Flavour::Physical)]
    #[case("LocalDeleteObject", Flavour::Logical)]
    fn test_rejected(#[case] name: &str, #[case] flavour: Flavour) {
        assert!(matches!(classify(name, flavour), Err(Error::Dispatch(_))));
    }
}
