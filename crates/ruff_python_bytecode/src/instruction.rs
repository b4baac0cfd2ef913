//! The instruction stream consumed by the control-flow graph builder.
//!
//! Instructions are CPython 3.7 wordcode: every instruction occupies two bytes,
//! `EXTENDED_ARG` prefixes have already been folded into the argument, and jump
//! arguments have been resolved to absolute target offsets.

use std::fmt;

use crate::cfg::block_stack::ScopeKind;

/// A byte offset into a code unit.
///
/// Offset `-1` is reserved for the synthetic function-exit node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Offset(i32);

impl Offset {
    /// The first instruction of every code unit.
    pub const ENTRY: Offset = Offset(0);

    /// The function-exit sentinel.
    pub const EXIT: Offset = Offset(-1);

    pub const fn new(value: i32) -> Self {
        Self(value)
    }

    pub const fn as_i32(self) -> i32 {
        self.0
    }

    pub const fn is_exit(self) -> bool {
        self.0 == Self::EXIT.0
    }
}

/// A decoded offset that does not fit the signed offset space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("offset {0} is out of range")]
pub struct OffsetOutOfRange(pub u32);

impl TryFrom<u32> for Offset {
    type Error = OffsetOutOfRange;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        i32::try_from(value)
            .map(Self)
            .map_err(|_| OffsetOutOfRange(value))
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

macro_rules! opcodes {
    ($($variant:ident = $byte:literal => $name:literal,)*) => {
        /// The closed set of CPython 3.7 opcodes.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        #[repr(u8)]
        pub enum Opcode {
            $($variant = $byte,)*
        }

        impl Opcode {
            /// The name used by `dis`, e.g. `SETUP_LOOP`.
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)*
                }
            }

            pub const fn from_byte(byte: u8) -> Option<Self> {
                match byte {
                    $($byte => Some(Self::$variant),)*
                    _ => None,
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(Self::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

opcodes! {
    PopTop = 1 => "POP_TOP",
    RotTwo = 2 => "ROT_TWO",
    RotThree = 3 => "ROT_THREE",
    DupTop = 4 => "DUP_TOP",
    DupTopTwo = 5 => "DUP_TOP_TWO",
    Nop = 9 => "NOP",
    UnaryPositive = 10 => "UNARY_POSITIVE",
    UnaryNegative = 11 => "UNARY_NEGATIVE",
    UnaryNot = 12 => "UNARY_NOT",
    UnaryInvert = 15 => "UNARY_INVERT",
    BinaryMatrixMultiply = 16 => "BINARY_MATRIX_MULTIPLY",
    InplaceMatrixMultiply = 17 => "INPLACE_MATRIX_MULTIPLY",
    BinaryPower = 19 => "BINARY_POWER",
    BinaryMultiply = 20 => "BINARY_MULTIPLY",
    BinaryModulo = 22 => "BINARY_MODULO",
    BinaryAdd = 23 => "BINARY_ADD",
    BinarySubtract = 24 => "BINARY_SUBTRACT",
    BinarySubscr = 25 => "BINARY_SUBSCR",
    BinaryFloorDivide = 26 => "BINARY_FLOOR_DIVIDE",
    BinaryTrueDivide = 27 => "BINARY_TRUE_DIVIDE",
    InplaceFloorDivide = 28 => "INPLACE_FLOOR_DIVIDE",
    InplaceTrueDivide = 29 => "INPLACE_TRUE_DIVIDE",
    GetAiter = 50 => "GET_AITER",
    GetAnext = 51 => "GET_ANEXT",
    BeforeAsyncWith = 52 => "BEFORE_ASYNC_WITH",
    InplaceAdd = 55 => "INPLACE_ADD",
    InplaceSubtract = 56 => "INPLACE_SUBTRACT",
    InplaceMultiply = 57 => "INPLACE_MULTIPLY",
    InplaceModulo = 59 => "INPLACE_MODULO",
    StoreSubscr = 60 => "STORE_SUBSCR",
    DeleteSubscr = 61 => "DELETE_SUBSCR",
    BinaryLshift = 62 => "BINARY_LSHIFT",
    BinaryRshift = 63 => "BINARY_RSHIFT",
    BinaryAnd = 64 => "BINARY_AND",
    BinaryXor = 65 => "BINARY_XOR",
    BinaryOr = 66 => "BINARY_OR",
    InplacePower = 67 => "INPLACE_POWER",
    GetIter = 68 => "GET_ITER",
    GetYieldFromIter = 69 => "GET_YIELD_FROM_ITER",
    PrintExpr = 70 => "PRINT_EXPR",
    LoadBuildClass = 71 => "LOAD_BUILD_CLASS",
    YieldFrom = 72 => "YIELD_FROM",
    GetAwaitable = 73 => "GET_AWAITABLE",
    InplaceLshift = 75 => "INPLACE_LSHIFT",
    InplaceRshift = 76 => "INPLACE_RSHIFT",
    InplaceAnd = 77 => "INPLACE_AND",
    InplaceXor = 78 => "INPLACE_XOR",
    InplaceOr = 79 => "INPLACE_OR",
    BreakLoop = 80 => "BREAK_LOOP",
    WithCleanupStart = 81 => "WITH_CLEANUP_START",
    WithCleanupFinish = 82 => "WITH_CLEANUP_FINISH",
    ReturnValue = 83 => "RETURN_VALUE",
    ImportStar = 84 => "IMPORT_STAR",
    SetupAnnotations = 85 => "SETUP_ANNOTATIONS",
    YieldValue = 86 => "YIELD_VALUE",
    PopBlock = 87 => "POP_BLOCK",
    EndFinally = 88 => "END_FINALLY",
    PopExcept = 89 => "POP_EXCEPT",
    StoreName = 90 => "STORE_NAME",
    DeleteName = 91 => "DELETE_NAME",
    UnpackSequence = 92 => "UNPACK_SEQUENCE",
    ForIter = 93 => "FOR_ITER",
    UnpackEx = 94 => "UNPACK_EX",
    StoreAttr = 95 => "STORE_ATTR",
    DeleteAttr = 96 => "DELETE_ATTR",
    StoreGlobal = 97 => "STORE_GLOBAL",
    DeleteGlobal = 98 => "DELETE_GLOBAL",
    LoadConst = 100 => "LOAD_CONST",
    LoadName = 101 => "LOAD_NAME",
    BuildTuple = 102 => "BUILD_TUPLE",
    BuildList = 103 => "BUILD_LIST",
    BuildSet = 104 => "BUILD_SET",
    BuildMap = 105 => "BUILD_MAP",
    LoadAttr = 106 => "LOAD_ATTR",
    CompareOp = 107 => "COMPARE_OP",
    ImportName = 108 => "IMPORT_NAME",
    ImportFrom = 109 => "IMPORT_FROM",
    JumpForward = 110 => "JUMP_FORWARD",
    JumpIfFalseOrPop = 111 => "JUMP_IF_FALSE_OR_POP",
    JumpIfTrueOrPop = 112 => "JUMP_IF_TRUE_OR_POP",
    JumpAbsolute = 113 => "JUMP_ABSOLUTE",
    PopJumpIfFalse = 114 => "POP_JUMP_IF_FALSE",
    PopJumpIfTrue = 115 => "POP_JUMP_IF_TRUE",
    LoadGlobal = 116 => "LOAD_GLOBAL",
    ContinueLoop = 119 => "CONTINUE_LOOP",
    SetupLoop = 120 => "SETUP_LOOP",
    SetupExcept = 121 => "SETUP_EXCEPT",
    SetupFinally = 122 => "SETUP_FINALLY",
    LoadFast = 124 => "LOAD_FAST",
    StoreFast = 125 => "STORE_FAST",
    DeleteFast = 126 => "DELETE_FAST",
    RaiseVarargs = 130 => "RAISE_VARARGS",
    CallFunction = 131 => "CALL_FUNCTION",
    MakeFunction = 132 => "MAKE_FUNCTION",
    BuildSlice = 133 => "BUILD_SLICE",
    LoadClosure = 135 => "LOAD_CLOSURE",
    LoadDeref = 136 => "LOAD_DEREF",
    StoreDeref = 137 => "STORE_DEREF",
    DeleteDeref = 138 => "DELETE_DEREF",
    CallFunctionKw = 141 => "CALL_FUNCTION_KW",
    CallFunctionEx = 142 => "CALL_FUNCTION_EX",
    SetupWith = 143 => "SETUP_WITH",
    ExtendedArg = 144 => "EXTENDED_ARG",
    ListAppend = 145 => "LIST_APPEND",
    SetAdd = 146 => "SET_ADD",
    MapAdd = 147 => "MAP_ADD",
    LoadClassderef = 148 => "LOAD_CLASSDEREF",
    BuildListUnpack = 149 => "BUILD_LIST_UNPACK",
    BuildMapUnpack = 150 => "BUILD_MAP_UNPACK",
    BuildMapUnpackWithCall = 151 => "BUILD_MAP_UNPACK_WITH_CALL",
    BuildTupleUnpack = 152 => "BUILD_TUPLE_UNPACK",
    BuildSetUnpack = 153 => "BUILD_SET_UNPACK",
    SetupAsyncWith = 154 => "SETUP_ASYNC_WITH",
    FormatValue = 155 => "FORMAT_VALUE",
    BuildConstKeyMap = 156 => "BUILD_CONST_KEY_MAP",
    BuildString = 157 => "BUILD_STRING",
    BuildTupleUnpackWithCall = 158 => "BUILD_TUPLE_UNPACK_WITH_CALL",
    LoadMethod = 160 => "LOAD_METHOD",
    CallMethod = 161 => "CALL_METHOD",
}

/// The first opcode byte that takes an argument.
const HAVE_ARGUMENT: u8 = 90;

/// How an opcode transfers control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, is_macro::Is)]
pub enum OpcodeClass {
    /// Falls through to the next instruction, or raises.
    Sequential,
    /// `JUMP_FORWARD`, `JUMP_ABSOLUTE`
    Jump,
    /// A two-way branch between the next instruction and the jump argument.
    /// Covers `FOR_ITER`, whose argument is the loop exhaustion target.
    ConditionalJump,
    Break,
    Continue,
    /// Pushes a handler scope whose exit is the jump argument.
    SetupScope(ScopeKind),
    PopBlock,
    PopExcept,
    EndFinally,
    Return,
    Raise,
}

impl Opcode {
    pub const fn byte(self) -> u8 {
        self as u8
    }

    pub const fn has_arg(self) -> bool {
        self.byte() >= HAVE_ARGUMENT
    }

    pub const fn class(self) -> OpcodeClass {
        match self {
            Self::JumpForward | Self::JumpAbsolute => OpcodeClass::Jump,
            Self::PopJumpIfFalse
            | Self::PopJumpIfTrue
            | Self::JumpIfFalseOrPop
            | Self::JumpIfTrueOrPop
            | Self::ForIter => OpcodeClass::ConditionalJump,
            Self::BreakLoop => OpcodeClass::Break,
            Self::ContinueLoop => OpcodeClass::Continue,
            Self::SetupLoop => OpcodeClass::SetupScope(ScopeKind::Loop),
            Self::SetupExcept => OpcodeClass::SetupScope(ScopeKind::Except),
            Self::SetupFinally => OpcodeClass::SetupScope(ScopeKind::Finally),
            Self::SetupWith | Self::SetupAsyncWith => OpcodeClass::SetupScope(ScopeKind::With),
            Self::PopBlock => OpcodeClass::PopBlock,
            Self::PopExcept => OpcodeClass::PopExcept,
            Self::EndFinally => OpcodeClass::EndFinally,
            Self::ReturnValue => OpcodeClass::Return,
            Self::RaiseVarargs => OpcodeClass::Raise,
            _ => OpcodeClass::Sequential,
        }
    }

    /// Whether the resolved argument of this opcode is an instruction offset.
    pub const fn has_jump_target(self) -> bool {
        matches!(
            self.class(),
            OpcodeClass::Jump
                | OpcodeClass::ConditionalJump
                | OpcodeClass::Continue
                | OpcodeClass::SetupScope(_)
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Instruction {
    pub opcode: Opcode,
    pub offset: Offset,
    /// The raw argument, if the opcode takes one.
    pub arg: Option<u32>,
    /// The resolved argument. For jump-bearing opcodes this is the absolute
    /// target offset.
    pub argval: Option<u32>,
    /// Whether any instruction in the code unit jumps to this offset.
    pub is_jump_target: bool,
}

impl Instruction {
    pub fn new(opcode: Opcode, offset: Offset, arg: Option<u32>) -> Self {
        Self {
            opcode,
            offset,
            arg,
            argval: arg,
            is_jump_target: false,
        }
    }

    #[must_use]
    pub fn with_argval(mut self, argval: u32) -> Self {
        self.argval = Some(argval);
        self
    }

    /// The offset this instruction may transfer control to, besides the next
    /// instruction. A target outside the offset space is treated as missing.
    pub fn jump_target(&self) -> Option<Offset> {
        if self.opcode.has_jump_target() {
            self.argval.and_then(|argval| Offset::try_from(argval).ok())
        } else {
            None
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.offset, self.opcode)?;
        if let Some(arg) = self.arg {
            write!(f, " {arg}")?;
        }
        if let Some(target) = self.jump_target() {
            if self.arg != self.argval {
                write!(f, " (to {target})")?;
            }
        }
        Ok(())
    }
}

/// Sets [`Instruction::is_jump_target`] on every instruction that is the
/// resolved argument of a jump-bearing instruction.
pub fn mark_jump_targets(instructions: &mut [Instruction]) {
    let targets: rustc_hash::FxHashSet<Offset> = instructions
        .iter()
        .filter_map(Instruction::jump_target)
        .collect();
    for instruction in instructions {
        instruction.is_jump_target = targets.contains(&instruction.offset);
    }
}
