//! Loaded modules: chunk parsing, the label walk and import resolution.
//!
//! A module is immutable after loading except for its import targets,
//! which start unresolved for not-yet-loaded modules and are filled in
//! on first call.

use std::ops::Range;
use std::sync::OnceLock;

use flate2::read::ZlibDecoder;
use plume_asm::beam::{self, CodeHeader};
use plume_asm::compact::{self, Operand};
use plume_asm::Opcode;

use crate::atom::AtomTable;
use crate::bif::{BifImpl, BifRegistry};
use crate::error::LoadError;
use crate::nif::{NifFn, NifRegistry};
use crate::term::Term;

/// An exported function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Export {
    /// Function name (global atom id).
    pub function_atom: u32,
    /// Arity.
    pub arity: u32,
    /// Entry label.
    pub label: u32,
}

/// A fun-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunEntry {
    /// Function name (global atom id).
    pub function_atom: u32,
    /// Arity including captured values.
    pub total_arity: u32,
    /// Entry label.
    pub label: u32,
    /// Number of captured values.
    pub n_free: u32,
}

/// Resolved call target of an import entry.
#[derive(Clone, Copy)]
pub enum CallTarget {
    /// A built-in function.
    Bif(BifImpl),
    /// A native function.
    Nif(NifFn),
    /// An exported function of a loaded module.
    Function {
        /// Module registry index.
        module: usize,
        /// Entry label.
        label: u32,
    },
}

impl core::fmt::Debug for CallTarget {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CallTarget::Bif(_) => f.write_str("CallTarget::Bif"),
            CallTarget::Nif(_) => f.write_str("CallTarget::Nif"),
            CallTarget::Function { module, label } => {
                write!(f, "CallTarget::Function({module}:{label})")
            }
        }
    }
}

/// One import table entry, resolved lazily.
#[derive(Debug)]
pub struct ImportEntry {
    /// Module name (global atom id).
    pub module_atom: u32,
    /// Function name (global atom id).
    pub function_atom: u32,
    /// Arity.
    pub arity: u32,
    pub(crate) target: OnceLock<CallTarget>,
}

/// A loaded module.
#[derive(Debug)]
pub struct Module {
    /// Registry index, assigned at registration.
    pub index: usize,
    /// Module name (global atom id).
    pub name_atom: u32,
    image: Vec<u8>,
    /// Instruction stream within `image`.
    code: Range<usize>,
    /// Offset of the `int_code_end` instruction within the stream.
    pub end_offset: usize,
    labels: Vec<usize>,
    local_atoms: Vec<u32>,
    imports: Vec<ImportEntry>,
    exports: Vec<Export>,
    funs: Vec<FunEntry>,
    strings: Range<usize>,
    literals_data: Vec<u8>,
    literal_entries: Vec<Range<usize>>,
}

fn read_u32(data: &[u8], at: usize, table: &'static str) -> Result<u32, LoadError> {
    data.get(at..at + 4)
        .map(|b| u32::from_be_bytes(b.try_into().expect("4-byte slice")))
        .ok_or(LoadError::BadTable(table))
}

impl Module {
    /// Parses a `FOR1`/`BEAM` image. Atoms are interned into `atoms`;
    /// imports matching a registered BIF or NIF resolve immediately,
    /// the rest stay unresolved until first call.
    pub fn load(
        image: Vec<u8>,
        atoms: &mut AtomTable,
        bifs: &BifRegistry,
        nifs: &NifRegistry,
    ) -> Result<Module, LoadError> {
        let chunks = beam::scan(&image)?;

        // Atom table: count, then length-prefixed names. Local index 0 is
        // unused.
        let atom_chunk = &image[chunks.atoms.clone()];
        let atom_count = read_u32(atom_chunk, 0, "atom")? as usize;
        let mut local_atoms = Vec::with_capacity(atom_count + 1);
        local_atoms.push(0);
        let mut at = 4;
        for _ in 0..atom_count {
            let len = *atom_chunk.get(at).ok_or(LoadError::BadTable("atom"))? as usize;
            let bytes = atom_chunk
                .get(at + 1..at + 1 + len)
                .ok_or(LoadError::BadTable("atom"))?;
            let name = core::str::from_utf8(bytes).map_err(|_| LoadError::BadTable("atom"))?;
            local_atoms.push(atoms.insert(name));
            at += len + 1;
        }
        let name_atom = *local_atoms.get(1).ok_or(LoadError::BadTable("atom"))?;

        // Imports: {module, function, arity} rows of local atom indices.
        let import_chunk = &image[chunks.imports.clone()];
        let import_count = read_u32(import_chunk, 0, "import")? as usize;
        let mut imports = Vec::with_capacity(import_count);
        for row in 0..import_count {
            let base = 4 + row * 12;
            let module_local = read_u32(import_chunk, base, "import")? as usize;
            let function_local = read_u32(import_chunk, base + 4, "import")? as usize;
            let arity = read_u32(import_chunk, base + 8, "import")?;
            let module_atom = *local_atoms.get(module_local).ok_or(LoadError::BadTable("import"))?;
            let function_atom = *local_atoms
                .get(function_local)
                .ok_or(LoadError::BadTable("import"))?;

            let target = OnceLock::new();
            if let Some(bif) = bifs.get(module_atom, function_atom, arity) {
                let _ = target.set(CallTarget::Bif(bif));
            } else if let Some(nif) = nifs.get(module_atom, function_atom, arity) {
                let _ = target.set(CallTarget::Nif(nif));
            }
            imports.push(ImportEntry {
                module_atom,
                function_atom,
                arity,
                target,
            });
        }

        // Exports: {function, arity, label} rows.
        let export_chunk = &image[chunks.exports.clone()];
        let export_count = read_u32(export_chunk, 0, "export")? as usize;
        let mut exports = Vec::with_capacity(export_count);
        for row in 0..export_count {
            let base = 4 + row * 12;
            let function_local = read_u32(export_chunk, base, "export")? as usize;
            exports.push(Export {
                function_atom: *local_atoms
                    .get(function_local)
                    .ok_or(LoadError::BadTable("export"))?,
                arity: read_u32(export_chunk, base + 4, "export")?,
                label: read_u32(export_chunk, base + 8, "export")?,
            });
        }

        // Fun table, if present.
        let mut funs = Vec::new();
        if let Some(range) = chunks.funs.clone() {
            let fun_chunk = &image[range];
            let count = read_u32(fun_chunk, 0, "fun")? as usize;
            for row in 0..count {
                let base = 4 + row * 24;
                let function_local = read_u32(fun_chunk, base, "fun")? as usize;
                funs.push(FunEntry {
                    function_atom: *local_atoms.get(function_local).ok_or(LoadError::BadTable("fun"))?,
                    total_arity: read_u32(fun_chunk, base + 4, "fun")?,
                    label: read_u32(fun_chunk, base + 8, "fun")?,
                    n_free: read_u32(fun_chunk, base + 16, "fun")?,
                });
            }
        }

        // Literals: LitT is a zlib stream prefixed with its uncompressed
        // size, LitU is the raw table. Either way the table is a count
        // followed by size-prefixed external-term blobs.
        let literals_data: Vec<u8> = if let Some(range) = chunks.literals_compressed.clone() {
            let chunk = &image[range];
            let expected = read_u32(chunk, 0, "literal")? as usize;
            let mut out = Vec::with_capacity(expected);
            use std::io::Read;
            ZlibDecoder::new(&chunk[4..])
                .read_to_end(&mut out)
                .map_err(|_| LoadError::BadCompression)?;
            if out.len() != expected {
                return Err(LoadError::BadCompression);
            }
            out
        } else if let Some(range) = chunks.literals_plain.clone() {
            image[range].to_vec()
        } else {
            Vec::new()
        };
        let mut literal_entries = Vec::new();
        if !literals_data.is_empty() {
            let count = read_u32(&literals_data, 0, "literal")? as usize;
            let mut at = 4;
            for index in 0..count {
                let size = read_u32(&literals_data, at, "literal")? as usize;
                let blob = at + 4..at + 4 + size;
                if blob.end > literals_data.len() {
                    return Err(LoadError::BadLiteral(index));
                }
                literal_entries.push(blob);
                at += 4 + size;
            }
        }

        // Code chunk: sub-header, then one walk to build the label table
        // and validate operand framing.
        let code_chunk = &image[chunks.code.clone()];
        let header = CodeHeader::parse(code_chunk)?;
        let code = chunks.code.start + header.code_start..chunks.code.end;
        let stream = &image[code.clone()];
        let mut labels = vec![0usize; header.label_count as usize + 2];
        let end_offset = walk_code(stream, &mut labels)?;

        Ok(Module {
            index: 0,
            name_atom,
            image,
            code,
            end_offset,
            labels,
            local_atoms,
            imports,
            exports,
            funs,
            strings: chunks.strings,
            literals_data,
            literal_entries,
        })
    }

    /// The instruction stream.
    #[inline]
    pub fn code(&self) -> &[u8] {
        &self.image[self.code.clone()]
    }

    /// Code offset of a label.
    pub fn label_offset(&self, label: u32) -> Option<usize> {
        self.labels.get(label as usize).copied()
    }

    /// Global atom id of a module-local atom index.
    pub fn global_atom(&self, local: u32) -> Option<u32> {
        self.local_atoms.get(local as usize).copied()
    }

    /// Atom term of a module-local atom index; index 0 is the empty
    /// list.
    pub fn atom_term(&self, local: u32) -> Option<Term> {
        if local == 0 {
            return Some(Term::NIL);
        }
        self.global_atom(local).map(Term::atom)
    }

    /// The import entry at an index.
    pub fn import(&self, index: usize) -> Option<&ImportEntry> {
        self.imports.get(index)
    }

    /// Entry label of an exported `function/arity`, if exported.
    pub fn search_exported(&self, function_atom: u32, arity: u32) -> Option<u32> {
        self.exports
            .iter()
            .find(|e| e.function_atom == function_atom && e.arity == arity)
            .map(|e| e.label)
    }

    /// The fun-table entry at an index.
    pub fn fun_entry(&self, index: usize) -> Option<FunEntry> {
        self.funs.get(index).copied()
    }

    /// Literal blob at an index.
    pub fn literal_blob(&self, index: usize) -> Option<&[u8]> {
        self.literal_entries.get(index).map(|r| &self.literals_data[r.clone()])
    }

    /// `len` bytes of the string pool at `offset`.
    pub fn string(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let pool = &self.image[self.strings.clone()];
        pool.get(offset..offset + len)
    }

    pub(crate) fn set_index(&mut self, index: usize) {
        self.index = index;
    }
}

/// One pass over the instruction stream: builds the label table,
/// validates operand framing and finds `int_code_end`.
fn walk_code(stream: &[u8], labels: &mut [usize]) -> Result<usize, LoadError> {
    let mut at = 0usize;
    loop {
        let byte = *stream.get(at).ok_or(LoadError::BadTable("code"))?;
        let op = Opcode::try_from(byte).map_err(|_| LoadError::UnknownOpcode {
            opcode: byte,
            offset: at,
        })?;
        let mut pos = at + 1;

        match op {
            Opcode::Label => {
                let label = compact::decode_label(stream, &mut pos)?;
                let slot = labels
                    .get_mut(label as usize)
                    .ok_or(LoadError::BadLabel(label))?;
                *slot = at;
            }
            Opcode::IntCodeEnd => return Ok(at),
            Opcode::PutTuple => {
                let size = compact::decode_untagged(stream, &mut pos)?;
                compact::decode_operand(stream, &mut pos)?; // destination
                for _ in 0..size {
                    let put = *stream.get(pos).ok_or(LoadError::BadTable("code"))?;
                    if put != Opcode::Put as u8 {
                        return Err(LoadError::UnknownOpcode {
                            opcode: put,
                            offset: pos,
                        });
                    }
                    pos += 1;
                    compact::decode_operand(stream, &mut pos)?;
                }
            }
            Opcode::SelectVal | Opcode::SelectTupleArity => {
                compact::decode_operand(stream, &mut pos)?; // source
                compact::decode_operand(stream, &mut pos)?; // default label
                walk_ext_list(stream, &mut pos)?;
            }
            Opcode::PutTuple2 => {
                compact::decode_operand(stream, &mut pos)?; // destination
                walk_ext_list(stream, &mut pos)?;
            }
            Opcode::PutMapAssoc | Opcode::PutMapExact => {
                for _ in 0..4 {
                    compact::decode_operand(stream, &mut pos)?;
                }
                walk_ext_list(stream, &mut pos)?;
            }
            Opcode::HasMapFields | Opcode::GetMapElements => {
                compact::decode_operand(stream, &mut pos)?;
                compact::decode_operand(stream, &mut pos)?;
                walk_ext_list(stream, &mut pos)?;
            }
            Opcode::MakeFun3 => {
                compact::decode_operand(stream, &mut pos)?;
                compact::decode_operand(stream, &mut pos)?;
                walk_ext_list(stream, &mut pos)?;
            }
            Opcode::InitYregs => {
                walk_ext_list(stream, &mut pos)?;
            }
            other => {
                for _ in 0..fixed_operands(other) {
                    compact::decode_operand(stream, &mut pos)?;
                }
            }
        }
        at = pos;
    }
}

fn walk_ext_list(stream: &[u8], pos: &mut usize) -> Result<(), LoadError> {
    let at = *pos;
    match compact::decode_operand(stream, pos)? {
        Operand::List(count) => {
            for _ in 0..count {
                compact::decode_operand(stream, pos)?;
            }
            Ok(())
        }
        _ => Err(LoadError::Operand(compact::OperandError::KindMismatch(at))),
    }
}

/// Operand count of every fixed-shape instruction.
fn fixed_operands(op: Opcode) -> usize {
    use Opcode::*;
    match op {
        IntCodeEnd | Return | Send | RemoveMessage | Timeout | IfEnd => 0,
        Label | Jump | Kill | Deallocate | LoopRecEnd | Wait | Badmatch | CaseEnd | CallFun
        | MakeFun2 | TryEnd | TryCase | TryCaseEnd | CatchEnd | Apply | BsContextToBinary | Line
        | RecvMark | RecvSet | RecvMarkerClear | RecvMarkerReserve | RecvMarkerUse => 1,
        Call | CallOnly | CallExt | CallExtOnly | Allocate | AllocateZero | TestHeap | LoopRec
        | WaitTimeout | IsInteger | IsFloat | IsNumber | IsAtom | IsPid | IsReference | IsPort
        | IsNil | IsBinary | IsList | IsNonemptyList | IsTuple | Move | Catch | Try
        | IsFunction | IsBoolean | IsBitstr | IsMap | Raise | BsPutString | BsSave2 | BsRestore2
        | Trim | ApplyLast | GetHd | GetTl | Swap | BsSetPosition | RecvMarkerBind => 2,
        FuncInfo | CallLast | CallExtLast | AllocateHeap | AllocateHeapZero | IsLt | IsGe | IsEq
        | IsNe | IsEqExact | IsNeExact | TestArity | GetList | GetTupleElement | SetTupleElement
        | PutList | IsFunction2 | BsTestTail2 | BsTestUnit | BsGetPosition | BsGetTail => 3,
        Bif1 | IsTaggedTuple | BsMatchString | BsStartMatch3 | BsStartMatch4 => 4,
        Bif2 | BsAdd | BsPutInteger | BsPutBinary | BsStartMatch2 | BsSkipBits2 | GcBif1 => 5,
        BsInit2 | BsInitBits | GcBif2 => 6,
        BsGetInteger2 | BsGetBinary2 | GcBif3 => 7,
        BsAppend => 8,
        Bif0 => 2,
        _ => 0,
    }
}

/// Resolves an unresolved import against the registry, caching the
/// result. `None` means `undef`.
pub(crate) fn resolve_import(
    module: &Module,
    index: usize,
    global: &crate::global::GlobalContext,
) -> Option<CallTarget> {
    let entry = module.import(index)?;
    if let Some(target) = entry.target.get() {
        return Some(*target);
    }
    let target_module = global.module_by_atom(entry.module_atom)?;
    let label = target_module.search_exported(entry.function_atom, entry.arity)?;
    let target = CallTarget::Function {
        module: target_module.index,
        label,
    };
    let _ = entry.target.set(target);
    tracing::debug!(
        import = index,
        module = target_module.index,
        label,
        "resolved import on first call"
    );
    Some(target)
}
