//! Naming context threaded through model traversal.

use crate::quant::QuantMode;

/// Dotted tensor name prefix plus the quantization mode inherited by children.
///
/// Derivation never mutates: [`Context::with_subname`] and [`Context::with_quant`]
/// return new values, so sibling branches of a traversal cannot observe each
/// other's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    name: String,
    quant: QuantMode,
}

impl Context {
    pub fn new(name: impl Into<String>, quant: QuantMode) -> Self {
        Self {
            name: name.into(),
            quant,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn quant(&self) -> QuantMode {
        self.quant
    }

    /// Append `segment` to the name, keeping the quantization mode.
    pub fn with_subname(&self, segment: &str) -> Self {
        let name = if self.name.is_empty() {
            segment.to_string()
        } else {
            format!("{}.{}", self.name, segment)
        };
        Self {
            name,
            quant: self.quant,
        }
    }

    /// Same name, quantization mode overridden for this subtree.
    pub fn with_quant(&self, quant: QuantMode) -> Self {
        Self {
            name: self.name.clone(),
            quant,
        }
    }
}
