//! Opcode table of the BEAM compact-instruction dialect.

use core::fmt;

/// Instructions understood by the loader, carrying the standard generic
/// opcode numbers.
///
/// The interpreter executes every variant except the [decode-only
/// set](Opcode::is_decode_only): newer opcodes whose operand framing the
/// loader must know to walk a code chunk, but which have no runtime
/// behavior in this VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[repr(u8)]
#[allow(missing_docs)] // variant names are the mnemonics
pub enum Opcode {
    Label = 1,
    FuncInfo = 2,
    IntCodeEnd = 3,
    Call = 4,
    CallLast = 5,
    CallOnly = 6,
    CallExt = 7,
    CallExtLast = 8,
    Bif0 = 9,
    Bif1 = 10,
    Bif2 = 11,
    Allocate = 12,
    AllocateHeap = 13,
    AllocateZero = 14,
    AllocateHeapZero = 15,
    TestHeap = 16,
    Kill = 17,
    Deallocate = 18,
    Return = 19,
    Send = 20,
    RemoveMessage = 21,
    Timeout = 22,
    LoopRec = 23,
    LoopRecEnd = 24,
    Wait = 25,
    WaitTimeout = 26,
    IsLt = 39,
    IsGe = 40,
    IsEq = 41,
    IsNe = 42,
    IsEqExact = 43,
    IsNeExact = 44,
    IsInteger = 45,
    IsFloat = 46,
    IsNumber = 47,
    IsAtom = 48,
    IsPid = 49,
    IsReference = 50,
    IsPort = 51,
    IsNil = 52,
    IsBinary = 53,
    IsList = 55,
    IsNonemptyList = 56,
    IsTuple = 57,
    TestArity = 58,
    SelectVal = 59,
    SelectTupleArity = 60,
    Jump = 61,
    Catch = 62,
    CatchEnd = 63,
    Move = 64,
    GetList = 65,
    GetTupleElement = 66,
    SetTupleElement = 67,
    PutList = 69,
    PutTuple = 70,
    Put = 71,
    Badmatch = 72,
    IfEnd = 73,
    CaseEnd = 74,
    CallFun = 75,
    IsFunction = 77,
    CallExtOnly = 78,
    BsPutInteger = 89,
    BsPutBinary = 90,
    BsPutString = 92,
    MakeFun2 = 103,
    Try = 104,
    TryEnd = 105,
    TryCase = 106,
    TryCaseEnd = 107,
    Raise = 108,
    BsInit2 = 109,
    BsAdd = 111,
    Apply = 112,
    ApplyLast = 113,
    IsBoolean = 114,
    IsFunction2 = 115,
    BsStartMatch2 = 116,
    BsGetInteger2 = 117,
    BsGetBinary2 = 119,
    BsSkipBits2 = 120,
    BsTestTail2 = 121,
    BsSave2 = 122,
    BsRestore2 = 123,
    GcBif1 = 124,
    GcBif2 = 125,
    IsBitstr = 129,
    BsContextToBinary = 130,
    BsTestUnit = 131,
    BsMatchString = 132,
    BsAppend = 134,
    Trim = 136,
    BsInitBits = 137,
    RecvMark = 150,
    RecvSet = 151,
    GcBif3 = 152,
    Line = 153,
    PutMapAssoc = 154,
    PutMapExact = 155,
    IsMap = 156,
    HasMapFields = 157,
    GetMapElements = 158,
    IsTaggedTuple = 159,
    GetHd = 162,
    GetTl = 163,
    PutTuple2 = 164,
    BsGetTail = 165,
    BsStartMatch3 = 166,
    BsGetPosition = 167,
    BsSetPosition = 168,
    Swap = 169,
    BsStartMatch4 = 170,
    MakeFun3 = 171,
    InitYregs = 172,
    RecvMarkerBind = 173,
    RecvMarkerClear = 174,
    RecvMarkerReserve = 175,
    RecvMarkerUse = 176,
}

impl Opcode {
    /// Opcodes the loader walks past but the interpreter refuses to
    /// execute.
    pub const fn is_decode_only(self) -> bool {
        matches!(
            self,
            Opcode::MakeFun3
                | Opcode::InitYregs
                | Opcode::RecvMarkerBind
                | Opcode::RecvMarkerClear
                | Opcode::RecvMarkerReserve
                | Opcode::RecvMarkerUse
        )
    }

    /// Lowercase mnemonic, as found in generic opcode listings.
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Label => "label",
            Opcode::FuncInfo => "func_info",
            Opcode::IntCodeEnd => "int_code_end",
            Opcode::Call => "call",
            Opcode::CallLast => "call_last",
            Opcode::CallOnly => "call_only",
            Opcode::CallExt => "call_ext",
            Opcode::CallExtLast => "call_ext_last",
            Opcode::Bif0 => "bif0",
            Opcode::Bif1 => "bif1",
            Opcode::Bif2 => "bif2",
            Opcode::Allocate => "allocate",
            Opcode::AllocateHeap => "allocate_heap",
            Opcode::AllocateZero => "allocate_zero",
            Opcode::AllocateHeapZero => "allocate_heap_zero",
            Opcode::TestHeap => "test_heap",
            Opcode::Kill => "kill",
            Opcode::Deallocate => "deallocate",
            Opcode::Return => "return",
            Opcode::Send => "send",
            Opcode::RemoveMessage => "remove_message",
            Opcode::Timeout => "timeout",
            Opcode::LoopRec => "loop_rec",
            Opcode::LoopRecEnd => "loop_rec_end",
            Opcode::Wait => "wait",
            Opcode::WaitTimeout => "wait_timeout",
            Opcode::IsLt => "is_lt",
            Opcode::IsGe => "is_ge",
            Opcode::IsEq => "is_eq",
            Opcode::IsNe => "is_ne",
            Opcode::IsEqExact => "is_eq_exact",
            Opcode::IsNeExact => "is_ne_exact",
            Opcode::IsInteger => "is_integer",
            Opcode::IsFloat => "is_float",
            Opcode::IsNumber => "is_number",
            Opcode::IsAtom => "is_atom",
            Opcode::IsPid => "is_pid",
            Opcode::IsReference => "is_reference",
            Opcode::IsPort => "is_port",
            Opcode::IsNil => "is_nil",
            Opcode::IsBinary => "is_binary",
            Opcode::IsList => "is_list",
            Opcode::IsNonemptyList => "is_nonempty_list",
            Opcode::IsTuple => "is_tuple",
            Opcode::TestArity => "test_arity",
            Opcode::SelectVal => "select_val",
            Opcode::SelectTupleArity => "select_tuple_arity",
            Opcode::Jump => "jump",
            Opcode::Catch => "catch",
            Opcode::CatchEnd => "catch_end",
            Opcode::Move => "move",
            Opcode::GetList => "get_list",
            Opcode::GetTupleElement => "get_tuple_element",
            Opcode::SetTupleElement => "set_tuple_element",
            Opcode::PutList => "put_list",
            Opcode::PutTuple => "put_tuple",
            Opcode::Put => "put",
            Opcode::Badmatch => "badmatch",
            Opcode::IfEnd => "if_end",
            Opcode::CaseEnd => "case_end",
            Opcode::CallFun => "call_fun",
            Opcode::IsFunction => "is_function",
            Opcode::CallExtOnly => "call_ext_only",
            Opcode::BsPutInteger => "bs_put_integer",
            Opcode::BsPutBinary => "bs_put_binary",
            Opcode::BsPutString => "bs_put_string",
            Opcode::MakeFun2 => "make_fun2",
            Opcode::Try => "try",
            Opcode::TryEnd => "try_end",
            Opcode::TryCase => "try_case",
            Opcode::TryCaseEnd => "try_case_end",
            Opcode::Raise => "raise",
            Opcode::BsInit2 => "bs_init2",
            Opcode::BsAdd => "bs_add",
            Opcode::Apply => "apply",
            Opcode::ApplyLast => "apply_last",
            Opcode::IsBoolean => "is_boolean",
            Opcode::IsFunction2 => "is_function2",
            Opcode::BsStartMatch2 => "bs_start_match2",
            Opcode::BsGetInteger2 => "bs_get_integer2",
            Opcode::BsGetBinary2 => "bs_get_binary2",
            Opcode::BsSkipBits2 => "bs_skip_bits2",
            Opcode::BsTestTail2 => "bs_test_tail2",
            Opcode::BsSave2 => "bs_save2",
            Opcode::BsRestore2 => "bs_restore2",
            Opcode::GcBif1 => "gc_bif1",
            Opcode::GcBif2 => "gc_bif2",
            Opcode::IsBitstr => "is_bitstr",
            Opcode::BsContextToBinary => "bs_context_to_binary",
            Opcode::BsTestUnit => "bs_test_unit",
            Opcode::BsMatchString => "bs_match_string",
            Opcode::BsAppend => "bs_append",
            Opcode::Trim => "trim",
            Opcode::BsInitBits => "bs_init_bits",
            Opcode::RecvMark => "recv_mark",
            Opcode::RecvSet => "recv_set",
            Opcode::GcBif3 => "gc_bif3",
            Opcode::Line => "line",
            Opcode::PutMapAssoc => "put_map_assoc",
            Opcode::PutMapExact => "put_map_exact",
            Opcode::IsMap => "is_map",
            Opcode::HasMapFields => "has_map_fields",
            Opcode::GetMapElements => "get_map_elements",
            Opcode::IsTaggedTuple => "is_tagged_tuple",
            Opcode::GetHd => "get_hd",
            Opcode::GetTl => "get_tl",
            Opcode::PutTuple2 => "put_tuple2",
            Opcode::BsGetTail => "bs_get_tail",
            Opcode::BsStartMatch3 => "bs_start_match3",
            Opcode::BsGetPosition => "bs_get_position",
            Opcode::BsSetPosition => "bs_set_position",
            Opcode::Swap => "swap",
            Opcode::BsStartMatch4 => "bs_start_match4",
            Opcode::MakeFun3 => "make_fun3",
            Opcode::InitYregs => "init_yregs",
            Opcode::RecvMarkerBind => "recv_marker_bind",
            Opcode::RecvMarkerClear => "recv_marker_clear",
            Opcode::RecvMarkerReserve => "recv_marker_reserve",
            Opcode::RecvMarkerUse => "recv_marker_use",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// The byte did not name a known opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown opcode {0}")]
pub struct UnknownOpcode(pub u8);

impl TryFrom<u8> for Opcode {
    type Error = UnknownOpcode;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        use Opcode::*;
        Ok(match b {
            1 => Label,
            2 => FuncInfo,
            3 => IntCodeEnd,
            4 => Call,
            5 => CallLast,
            6 => CallOnly,
            7 => CallExt,
            8 => CallExtLast,
            9 => Bif0,
            10 => Bif1,
            11 => Bif2,
            12 => Allocate,
            13 => AllocateHeap,
            14 => AllocateZero,
            15 => AllocateHeapZero,
            16 => TestHeap,
            17 => Kill,
            18 => Deallocate,
            19 => Return,
            20 => Send,
            21 => RemoveMessage,
            22 => Timeout,
            23 => LoopRec,
            24 => LoopRecEnd,
            25 => Wait,
            26 => WaitTimeout,
            39 => IsLt,
            40 => IsGe,
            41 => IsEq,
            42 => IsNe,
            43 => IsEqExact,
            44 => IsNeExact,
            45 => IsInteger,
            46 => IsFloat,
            47 => IsNumber,
            48 => IsAtom,
            49 => IsPid,
            50 => IsReference,
            51 => IsPort,
            52 => IsNil,
            53 => IsBinary,
            55 => IsList,
            56 => IsNonemptyList,
            57 => IsTuple,
            58 => TestArity,
            59 => SelectVal,
            60 => SelectTupleArity,
            61 => Jump,
            62 => Catch,
            63 => CatchEnd,
            64 => Move,
            65 => GetList,
            66 => GetTupleElement,
            67 => SetTupleElement,
            69 => PutList,
            70 => PutTuple,
            71 => Put,
            72 => Badmatch,
            73 => IfEnd,
            74 => CaseEnd,
            75 => CallFun,
            77 => IsFunction,
            78 => CallExtOnly,
            89 => BsPutInteger,
            90 => BsPutBinary,
            92 => BsPutString,
            103 => MakeFun2,
            104 => Try,
            105 => TryEnd,
            106 => TryCase,
            107 => TryCaseEnd,
            108 => Raise,
            109 => BsInit2,
            111 => BsAdd,
            112 => Apply,
            113 => ApplyLast,
            114 => IsBoolean,
            115 => IsFunction2,
            116 => BsStartMatch2,
            117 => BsGetInteger2,
            119 => BsGetBinary2,
            120 => BsSkipBits2,
            121 => BsTestTail2,
            122 => BsSave2,
            123 => BsRestore2,
            124 => GcBif1,
            125 => GcBif2,
            129 => IsBitstr,
            130 => BsContextToBinary,
            131 => BsTestUnit,
            132 => BsMatchString,
            134 => BsAppend,
            136 => Trim,
            137 => BsInitBits,
            150 => RecvMark,
            151 => RecvSet,
            152 => GcBif3,
            153 => Line,
            154 => PutMapAssoc,
            155 => PutMapExact,
            156 => IsMap,
            157 => HasMapFields,
            158 => GetMapElements,
            159 => IsTaggedTuple,
            162 => GetHd,
            163 => GetTl,
            164 => PutTuple2,
            165 => BsGetTail,
            166 => BsStartMatch3,
            167 => BsGetPosition,
            168 => BsSetPosition,
            169 => Swap,
            170 => BsStartMatch4,
            171 => MakeFun3,
            172 => InitYregs,
            173 => RecvMarkerBind,
            174 => RecvMarkerClear,
            175 => RecvMarkerReserve,
            176 => RecvMarkerUse,
            other => return Err(UnknownOpcode(other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn opcode_byte_round_trip() {
        for op in Opcode::iter() {
            let byte = op as u8;
            assert_eq!(Opcode::try_from(byte), Ok(op));
        }
    }

    #[test]
    fn gaps_are_rejected() {
        for byte in [0u8, 27, 38, 54, 68, 76, 91, 110, 128, 149, 177, 255] {
            assert_eq!(Opcode::try_from(byte), Err(UnknownOpcode(byte)));
        }
    }
}
