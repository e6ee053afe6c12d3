use std::fmt;

use crate::refs::{RawRef, ResultType};

/// The fixed set of side-effectful actions a graph can schedule. Operand
/// arity and result type are fully determined by the opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    ProviderInstanceConfig,
    ProviderInstanceOpen,
    ProviderInstanceClose,
    ResourceInstanceDesired,
    ResourceInstancePrior,
    ManagedFinalPlan,
    ManagedApply,
    ManagedDepose,
    ManagedAlreadyDeposed,
    ManagedChangeAddr,
    DataRead,
    EphemeralOpen,
    EphemeralState,
    EphemeralClose,
}

impl OpCode {
    pub const ALL: [OpCode; 14] = [
        OpCode::ProviderInstanceConfig,
        OpCode::ProviderInstanceOpen,
        OpCode::ProviderInstanceClose,
        OpCode::ResourceInstanceDesired,
        OpCode::ResourceInstancePrior,
        OpCode::ManagedFinalPlan,
        OpCode::ManagedApply,
        OpCode::ManagedDepose,
        OpCode::ManagedAlreadyDeposed,
        OpCode::ManagedChangeAddr,
        OpCode::DataRead,
        OpCode::EphemeralOpen,
        OpCode::EphemeralState,
        OpCode::EphemeralClose,
    ];

    /// Expected operand types, in order.
    pub fn operand_types(self) -> &'static [ResultType] {
        use ResultType::*;
        match self {
            OpCode::ProviderInstanceConfig => &[ProviderAddr, Unit],
            OpCode::ProviderInstanceOpen => &[ProviderConfig],
            OpCode::ProviderInstanceClose => &[ProviderClient, Unit],
            OpCode::ResourceInstanceDesired => &[ResourceAddr, Unit],
            OpCode::ResourceInstancePrior => &[ResourceAddr],
            OpCode::ManagedFinalPlan => &[Desired, Object, Value, ProviderClient],
            OpCode::ManagedApply => &[FinalPlan, Object, ProviderClient],
            OpCode::ManagedDepose => &[Object],
            OpCode::ManagedAlreadyDeposed => &[ResourceAddr, Value],
            OpCode::ManagedChangeAddr => &[Object, ResourceAddr],
            OpCode::DataRead => &[Desired, Value, ProviderClient],
            OpCode::EphemeralOpen => &[Desired, ProviderClient],
            OpCode::EphemeralState => &[Ephemeral],
            OpCode::EphemeralClose => &[Ephemeral, Unit],
        }
    }

    pub fn result_type(self) -> ResultType {
        use ResultType::*;
        match self {
            OpCode::ProviderInstanceConfig => ProviderConfig,
            OpCode::ProviderInstanceOpen => ProviderClient,
            OpCode::ProviderInstanceClose => Unit,
            OpCode::ResourceInstanceDesired => Desired,
            OpCode::ResourceInstancePrior => Object,
            OpCode::ManagedFinalPlan => FinalPlan,
            OpCode::ManagedApply => Object,
            OpCode::ManagedDepose => Object,
            OpCode::ManagedAlreadyDeposed => Object,
            OpCode::ManagedChangeAddr => Object,
            OpCode::DataRead => Object,
            OpCode::EphemeralOpen => Ephemeral,
            OpCode::EphemeralState => Object,
            OpCode::EphemeralClose => Unit,
        }
    }

    /// Close-type operations release a resource and therefore run even when
    /// their user-waiter reports upstream failure.
    pub fn is_close(self) -> bool {
        matches!(self, OpCode::ProviderInstanceClose | OpCode::EphemeralClose)
    }

    pub fn name(self) -> &'static str {
        match self {
            OpCode::ProviderInstanceConfig => "ProviderInstanceConfig",
            OpCode::ProviderInstanceOpen => "ProviderInstanceOpen",
            OpCode::ProviderInstanceClose => "ProviderInstanceClose",
            OpCode::ResourceInstanceDesired => "ResourceInstanceDesired",
            OpCode::ResourceInstancePrior => "ResourceInstancePrior",
            OpCode::ManagedFinalPlan => "ManagedFinalPlan",
            OpCode::ManagedApply => "ManagedApply",
            OpCode::ManagedDepose => "ManagedDepose",
            OpCode::ManagedAlreadyDeposed => "ManagedAlreadyDeposed",
            OpCode::ManagedChangeAddr => "ManagedChangeAddr",
            OpCode::DataRead => "DataRead",
            OpCode::EphemeralOpen => "EphemeralOpen",
            OpCode::EphemeralState => "EphemeralState",
            OpCode::EphemeralClose => "EphemeralClose",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One scheduled side effect: an opcode plus its operand references. The
/// operation's position in the graph's table is its stable identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub opcode: OpCode,
    pub operands: Vec<RawRef>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_opcode_has_a_consistent_signature() {
        for opcode in OpCode::ALL {
            let operands = opcode.operand_types();
            assert!(!operands.is_empty(), "{} has no operands", opcode);
            assert!(operands.len() <= 4, "{} has too many operands", opcode);
            // close operations consume the resource-holding input first
            if opcode.is_close() {
                assert_eq!(operands[operands.len() - 1], ResultType::Unit);
                assert_eq!(opcode.result_type(), ResultType::Unit);
            }
        }
    }
}
