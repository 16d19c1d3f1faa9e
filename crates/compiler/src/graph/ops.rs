//! Operator kinds
//!
//! The exporter targets a fixed ONNX opset, so the operator set is a closed
//! enumeration. Every stage dispatches on `OpKind` with a `match`; adding an
//! operator is one line in the table below plus a handler per stage, and the
//! compiler points at every `match` that needs one.

use std::fmt;
use std::str::FromStr;

/// Generate the `OpKind` enum together with its name table
///
/// ```text
/// define_op_kinds! {
///     Conv => "Conv",
///     Add => "Add",
/// }
/// ```
macro_rules! define_op_kinds {
    (
        $(
            $(#[$variant_meta:meta])*
            $variant:ident => $name:literal
        ),* $(,)?
    ) => {
        /// Operator kind of a graph node (ONNX `op_type`)
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum OpKind {
            $(
                $(#[$variant_meta])*
                $variant,
            )*
        }

        impl OpKind {
            /// Every supported operator kind
            pub const ALL: &'static [OpKind] = &[$(OpKind::$variant),*];

            /// ONNX `op_type` string
            pub fn as_str(self) -> &'static str {
                match self {
                    $(OpKind::$variant => $name,)*
                }
            }

            /// Look up an ONNX `op_type`
            pub fn from_op_type(op_type: &str) -> Option<Self> {
                match op_type {
                    $($name => Some(OpKind::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

define_op_kinds! {
    // Convolution and pooling
    Conv => "Conv",
    MaxPool => "MaxPool",
    BatchNormalization => "BatchNormalization",
    Resize => "Resize",

    // Elementwise
    Add => "Add",
    Sub => "Sub",
    Mul => "Mul",
    Div => "Div",
    Sigmoid => "Sigmoid",
    Identity => "Identity",
    Cast => "Cast",

    // Tensor manipulation
    Concat => "Concat",
    Split => "Split",
    Reshape => "Reshape",
    Transpose => "Transpose",
    Slice => "Slice",
    Gather => "Gather",
    Unsqueeze => "Unsqueeze",

    // Shape computation
    Shape => "Shape",
    ConstantOfShape => "ConstantOfShape",
    CumSum => "CumSum",

    // Reductions
    Softmax => "Softmax",
    ReduceMax => "ReduceMax",
    ArgMax => "ArgMax",

    /// Greedy IoU suppression; output row count depends on tensor contents
    NonMaxSuppression => "NonMaxSuppression",
}

impl OpKind {
    /// Binary elementwise operators with numpy broadcasting
    pub fn is_binary_elementwise(self) -> bool {
        matches!(self, OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div)
    }

    /// Operators whose output shape depends on input values, not only shapes
    pub fn is_data_dependent(self) -> bool {
        matches!(self, OpKind::NonMaxSuppression)
    }

    /// Operators the simplifier may evaluate at export time
    pub fn is_foldable(self) -> bool {
        !self.is_data_dependent()
    }

    pub fn is_commutative(self) -> bool {
        matches!(self, OpKind::Add | OpKind::Mul)
    }
}

/// Error returned when parsing an unknown operator name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownOpKind(pub String);

impl fmt::Display for UnknownOpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown operator kind '{}'", self.0)
    }
}

impl std::error::Error for UnknownOpKind {}

impl FromStr for OpKind {
    type Err = UnknownOpKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OpKind::from_op_type(s).ok_or_else(|| UnknownOpKind(s.to_string()))
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_table_round_trips() {
        for &op in OpKind::ALL {
            assert_eq!(op.as_str().parse::<OpKind>(), Ok(op));
        }
    }

    #[test]
    fn test_unknown_op() {
        let err = "LayerNormalization".parse::<OpKind>().unwrap_err();
        assert_eq!(err.0, "LayerNormalization");
    }

    #[test]
    fn test_classification() {
        assert!(OpKind::Mul.is_binary_elementwise());
        assert!(!OpKind::Concat.is_binary_elementwise());
        assert!(OpKind::NonMaxSuppression.is_data_dependent());
        assert!(!OpKind::NonMaxSuppression.is_foldable());
    }
}
