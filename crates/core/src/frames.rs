//! Abstract interpretation of method bodies.
//!
//! The encoder cannot trust declared max-stack/max-locals after mutation, and
//! frame-verification data has to be regenerated whenever control flow
//! changes. This module walks each body with a worklist dataflow pass over a
//! small verification-type lattice, producing the entry frame for every
//! branch target and exception handler plus the recomputed stack and local
//! limits.
//!
//! Reference merges are conservative: two different class types join to
//! `java/lang/Object`. That is the same simplification classfile writers make
//! when no class hierarchy is available, and it is accepted by the verifier
//! for code that does not re-narrow a merged reference without a checkcast.

use crate::constpool::ConstEntry;
use crate::model::{ClassModel, Insn, Label, Member, MethodBody, ACC_STATIC};
use crate::opcode as op;
use classcloak_utils::errors::WriterError;
use std::collections::{HashMap, VecDeque};

/// Verification type, as it appears in `StackMapTable` entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VType {
    Top,
    Int,
    Float,
    Long,
    Double,
    Null,
    UninitThis,
    /// Internal binary name, or an array descriptor such as `[I`.
    Object(String),
    /// Value produced by the `new` at the given code index, not yet
    /// initialized by `invokespecial <init>`.
    Uninit(usize),
    /// `jsr` return address; only legal in pre-frame class versions.
    Retaddr,
}

impl VType {
    /// Slot width: category-2 values occupy two stack/local slots.
    pub const fn width(&self) -> u16 {
        match self {
            Self::Long | Self::Double => 2,
            _ => 1,
        }
    }
}

/// Machine state at one point in a method.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    /// Slot representation: a `Long`/`Double` is followed by a `Top` shadow.
    pub locals: Vec<VType>,
    /// One entry per value, category-2 values are single entries.
    pub stack: Vec<VType>,
}

impl Frame {
    pub fn stack_slots(&self) -> u16 {
        self.stack.iter().map(VType::width).sum()
    }
}

/// Result of analyzing one method body.
#[derive(Debug)]
pub struct MethodFacts {
    pub max_stack: u16,
    pub max_locals: u16,
    /// Entry frames for every branch-target and handler position, keyed by
    /// the code index of the first real instruction there, in code order.
    pub frames: Vec<(usize, Frame)>,
    /// Machine state entering each instruction, index-aligned with
    /// `body.code` (marks included). `None` only for unreached marks.
    pub entry_frames: Vec<Option<Frame>>,
}

/// Analyzes `body`, which must belong to `member` of `model`.
pub fn analyze(
    model: &ClassModel,
    member: &Member,
    body: &MethodBody,
) -> Result<MethodFacts, WriterError> {
    let method = model.member_name(member).to_owned();
    let descriptor = model
        .pool
        .utf8(member.descriptor)
        .ok_or(WriterError::DanglingIndex {
            index: member.descriptor,
            context: "method descriptor",
        })?;
    let code = &body.code;

    let mut label_idx: HashMap<Label, usize> = HashMap::new();
    for (i, insn) in code.iter().enumerate() {
        if let Insn::Mark(label) = insn {
            label_idx.insert(*label, i);
        }
    }
    let resolve = |label: Label| -> Result<usize, WriterError> {
        label_idx
            .get(&label)
            .copied()
            .ok_or(WriterError::UnresolvedLabel(label.0))
    };

    // Exception ranges resolved to code indices up front.
    let mut ranges = Vec::with_capacity(body.exceptions.len());
    for range in &body.exceptions {
        let catch = match range.catch_type {
            Some(idx) => VType::Object(
                model
                    .pool
                    .class_name(idx)
                    .ok_or(WriterError::DanglingIndex {
                        index: idx,
                        context: "exception catch_type",
                    })?
                    .to_owned(),
            ),
            None => VType::Object("java/lang/Throwable".to_owned()),
        };
        ranges.push((
            resolve(range.start)?,
            resolve(range.end)?,
            resolve(range.handler)?,
            catch,
        ));
    }

    let mut interp = Interp {
        model,
        code,
        method: &method,
        max_stack: 0,
        max_locals: 0,
    };

    let init = interp.initial_frame(member, descriptor)?;
    interp.max_locals = init.locals.len() as u16;

    let mut states: Vec<Option<Frame>> = vec![None; code.len()];
    let mut work = VecDeque::new();
    if !code.is_empty() {
        states[0] = Some(init);
        work.push_back(0usize);
    }

    while let Some(i) = work.pop_front() {
        let frame = states[i].clone().ok_or(WriterError::UnreachableCode {
            method: method.clone(),
            at: i,
        })?;
        interp.max_stack = interp.max_stack.max(frame.stack_slots());

        // Any instruction inside a protected range can transfer to the
        // handler with the locals it entered with and just the thrown value
        // on the stack.
        if !matches!(code[i], Insn::Mark(_)) {
            for (start, end, handler, catch) in &ranges {
                if i >= *start && i < *end {
                    let hframe = Frame {
                        locals: frame.locals.clone(),
                        stack: vec![catch.clone()],
                    };
                    merge_into(&mut states, &mut work, *handler, hframe, &method, i)?;
                }
            }
        }

        let mut out = frame;
        let flow = interp.exec(i, &mut out)?;

        match flow {
            Flow::Next => {
                merge_next(&mut states, &mut work, code, i, out, &method)?;
            }
            Flow::Branch(target) => {
                merge_into(&mut states, &mut work, resolve(target)?, out, &method, i)?;
            }
            Flow::CondBranch(target) => {
                let idx = resolve(target)?;
                merge_into(&mut states, &mut work, idx, out.clone(), &method, i)?;
                merge_next(&mut states, &mut work, code, i, out, &method)?;
            }
            Flow::Switch(targets) => {
                for target in targets {
                    let idx = resolve(target)?;
                    merge_into(&mut states, &mut work, idx, out.clone(), &method, i)?;
                }
            }
            Flow::Jsr(target) => {
                // Inline-subroutine approximation: the subroutine entry sees
                // the return address, the continuation sees the frame as-is.
                let idx = resolve(target)?;
                let mut sub = out.clone();
                sub.stack.push(VType::Retaddr);
                merge_into(&mut states, &mut work, idx, sub, &method, i)?;
                merge_next(&mut states, &mut work, code, i, out, &method)?;
            }
            Flow::Stop => {}
        }
    }

    for (i, insn) in code.iter().enumerate() {
        if !matches!(insn, Insn::Mark(_)) && states[i].is_none() {
            return Err(WriterError::UnreachableCode { method, at: i });
        }
    }

    // Frames are needed at every label a branch, switch, or handler can
    // reach; the encoder serializes them in code order.
    let mut wanted: Vec<Label> = Vec::new();
    for insn in code {
        insn.for_each_target(|l| wanted.push(l));
    }
    for range in &body.exceptions {
        wanted.push(range.handler);
    }
    wanted.sort_unstable();
    wanted.dedup();

    // Adjacent marks share a byte offset, so labels in a mark run collapse
    // onto the first real instruction after them; the state there is the
    // merge of every edge into the run.
    let mut by_idx = std::collections::BTreeMap::new();
    for label in wanted {
        let mut idx = resolve(label)?;
        while matches!(code.get(idx), Some(Insn::Mark(_))) {
            idx += 1;
        }
        if idx >= code.len() {
            return Err(WriterError::UnreachableCode {
                method: method.clone(),
                at: code.len(),
            });
        }
        let frame = states[idx].clone().ok_or(WriterError::UnreachableCode {
            method: method.clone(),
            at: idx,
        })?;
        by_idx.insert(idx, frame);
    }
    let frames = by_idx.into_iter().collect();

    Ok(MethodFacts {
        max_stack: interp.max_stack,
        max_locals: interp.max_locals,
        frames,
        entry_frames: states,
    })
}

enum Flow {
    Next,
    Branch(Label),
    CondBranch(Label),
    Switch(Vec<Label>),
    Jsr(Label),
    Stop,
}

fn merge_next(
    states: &mut [Option<Frame>],
    work: &mut VecDeque<usize>,
    code: &[Insn],
    i: usize,
    frame: Frame,
    method: &str,
) -> Result<(), WriterError> {
    if i + 1 >= code.len() {
        return Err(WriterError::UnreachableCode {
            method: method.to_owned(),
            at: i,
        });
    }
    merge_into(states, work, i + 1, frame, method, i)
}

fn merge_into(
    states: &mut [Option<Frame>],
    work: &mut VecDeque<usize>,
    target: usize,
    frame: Frame,
    method: &str,
    at: usize,
) -> Result<(), WriterError> {
    match &mut states[target] {
        slot @ None => {
            *slot = Some(frame);
            work.push_back(target);
        }
        Some(existing) => {
            if merge_frames(existing, &frame, method, at)? {
                work.push_back(target);
            }
        }
    }
    Ok(())
}

/// Merges `from` into `into`, returning whether `into` changed.
fn merge_frames(
    into: &mut Frame,
    from: &Frame,
    method: &str,
    at: usize,
) -> Result<bool, WriterError> {
    let mut changed = false;

    let len = into.locals.len().max(from.locals.len());
    into.locals.resize(len, VType::Top);
    for (slot, merged) in into.locals.iter_mut().enumerate() {
        let other = from.locals.get(slot).unwrap_or(&VType::Top);
        let joined = join(merged, other);
        if joined != *merged {
            *merged = joined;
            changed = true;
        }
    }

    if into.stack.len() != from.stack.len() {
        return Err(WriterError::FrameMerge {
            method: method.to_owned(),
            at,
            msg: format!(
                "stack height mismatch: {} vs {}",
                into.stack.len(),
                from.stack.len()
            ),
        });
    }
    for (pos, merged) in into.stack.iter_mut().enumerate() {
        let other = &from.stack[pos];
        let joined = join(merged, other);
        if joined == VType::Top && *merged != VType::Top {
            return Err(WriterError::FrameMerge {
                method: method.to_owned(),
                at,
                msg: format!("incompatible stack entry {pos}: {merged:?} vs {other:?}"),
            });
        }
        if joined != *merged {
            *merged = joined;
            changed = true;
        }
    }
    Ok(changed)
}

fn join(a: &VType, b: &VType) -> VType {
    if a == b {
        return a.clone();
    }
    match (a, b) {
        (VType::Null, VType::Object(_) | VType::Null) => b.clone(),
        (VType::Object(_), VType::Null) => a.clone(),
        (VType::Object(_), VType::Object(_)) => VType::Object("java/lang/Object".to_owned()),
        _ => VType::Top,
    }
}

struct Interp<'a> {
    model: &'a ClassModel,
    code: &'a [Insn],
    method: &'a str,
    max_stack: u16,
    max_locals: u16,
}

impl Interp<'_> {
    fn initial_frame(&self, member: &Member, descriptor: &str) -> Result<Frame, WriterError> {
        let mut locals = Vec::new();
        if member.access & ACC_STATIC == 0 {
            let this_name = self
                .model
                .this_class_name()
                .unwrap_or("java/lang/Object")
                .to_owned();
            if self.method == "<init>" {
                locals.push(VType::UninitThis);
            } else {
                locals.push(VType::Object(this_name));
            }
        }
        let (params, _) = parse_method_descriptor(descriptor)?;
        for param in params {
            let wide = param.width() == 2;
            locals.push(param);
            if wide {
                locals.push(VType::Top);
            }
        }
        Ok(Frame {
            locals,
            stack: Vec::new(),
        })
    }

    fn push(&mut self, frame: &mut Frame, v: VType) {
        frame.stack.push(v);
        self.max_stack = self.max_stack.max(frame.stack_slots());
    }

    fn pop(&mut self, frame: &mut Frame, at: usize) -> Result<VType, WriterError> {
        frame.stack.pop().ok_or_else(|| WriterError::StackUnderflow {
            method: self.method.to_owned(),
            at,
        })
    }

    /// Pops `n` values regardless of category.
    fn popn(&mut self, frame: &mut Frame, n: usize, at: usize) -> Result<(), WriterError> {
        for _ in 0..n {
            self.pop(frame, at)?;
        }
        Ok(())
    }

    /// Pops a two-slot group: one category-2 value or two category-1 values.
    fn pop_group2(&mut self, frame: &mut Frame, at: usize) -> Result<Vec<VType>, WriterError> {
        let top = self.pop(frame, at)?;
        if top.width() == 2 {
            Ok(vec![top])
        } else {
            let below = self.pop(frame, at)?;
            Ok(vec![below, top])
        }
    }

    fn load(&self, frame: &Frame, slot: u16) -> VType {
        frame
            .locals
            .get(slot as usize)
            .cloned()
            .unwrap_or(VType::Top)
    }

    /// Records that `width` slots starting at `slot` are in use. The limit
    /// fields are u16, so a slot right at the index ceiling is an error, not
    /// a wrap.
    fn use_local(&mut self, slot: u16, width: u16) -> Result<(), WriterError> {
        let needed = slot.checked_add(width).ok_or(WriterError::OffsetOverflow {
            context: "local variable index",
            value: slot as usize + width as usize,
        })?;
        self.max_locals = self.max_locals.max(needed);
        Ok(())
    }

    fn store(&mut self, frame: &mut Frame, slot: u16, v: VType) -> Result<(), WriterError> {
        let wide = v.width() == 2;
        self.use_local(slot, if wide { 2 } else { 1 })?;
        let needed = slot as usize + if wide { 2 } else { 1 };
        if frame.locals.len() < needed {
            frame.locals.resize(needed, VType::Top);
        }
        // Overwriting the low half of a category-2 value kills it.
        if slot > 0 {
            if let Some(prev) = frame.locals.get_mut(slot as usize - 1) {
                if prev.width() == 2 {
                    *prev = VType::Top;
                }
            }
        }
        frame.locals[slot as usize] = v;
        if wide {
            frame.locals[slot as usize + 1] = VType::Top;
        }
        Ok(())
    }

    fn exec(&mut self, i: usize, frame: &mut Frame) -> Result<Flow, WriterError> {
        let insn = &self.code[i];
        match insn {
            Insn::Mark(_) => Ok(Flow::Next),
            Insn::Push8(_) | Insn::Push16(_) => {
                self.push(frame, VType::Int);
                Ok(Flow::Next)
            }
            Insn::Ldc(index) => {
                let v = self.loadable_type(*index, false)?;
                self.push(frame, v);
                Ok(Flow::Next)
            }
            Insn::Ldc2(index) => {
                let v = self.loadable_type(*index, true)?;
                self.push(frame, v);
                Ok(Flow::Next)
            }
            Insn::Local { op: lop, slot } => self.exec_local(i, *lop, *slot, frame),
            Insn::Iinc { slot, .. } => {
                self.use_local(*slot, 1)?;
                Ok(Flow::Next)
            }
            Insn::Branch { op: bop, target } => {
                match *bop {
                    op::GOTO => return Ok(Flow::Branch(*target)),
                    op::JSR => return Ok(Flow::Jsr(*target)),
                    op::IFEQ..=op::IFLE | op::IFNULL | op::IFNONNULL => {
                        self.popn(frame, 1, i)?;
                    }
                    op::IF_ICMPEQ..=op::IF_ACMPNE => {
                        self.popn(frame, 2, i)?;
                    }
                    other => {
                        return Err(WriterError::FrameMerge {
                            method: self.method.to_owned(),
                            at: i,
                            msg: format!("unexpected branch opcode 0x{other:02x}"),
                        })
                    }
                }
                Ok(Flow::CondBranch(*target))
            }
            Insn::TableSwitch {
                default, targets, ..
            } => {
                self.popn(frame, 1, i)?;
                let mut all = vec![*default];
                all.extend_from_slice(targets);
                Ok(Flow::Switch(all))
            }
            Insn::LookupSwitch { default, pairs } => {
                self.popn(frame, 1, i)?;
                let mut all = vec![*default];
                all.extend(pairs.iter().map(|(_, l)| *l));
                Ok(Flow::Switch(all))
            }
            Insn::Cp { op: cop, index } => self.exec_cp(i, *cop, *index, frame),
            Insn::InvokeInterface { index, .. } => {
                self.invoke(i, *index, true, frame)?;
                Ok(Flow::Next)
            }
            Insn::InvokeDynamic { index } => {
                let descriptor = self
                    .model
                    .pool
                    .dynamic_descriptor(*index)
                    .ok_or(WriterError::DanglingIndex {
                        index: *index,
                        context: "invokedynamic",
                    })?
                    .to_owned();
                self.call(i, &descriptor, false, frame)?;
                Ok(Flow::Next)
            }
            Insn::NewArray(atype) => {
                self.popn(frame, 1, i)?;
                let desc = match atype {
                    4 => "[Z",
                    5 => "[C",
                    6 => "[F",
                    7 => "[D",
                    8 => "[B",
                    9 => "[S",
                    10 => "[I",
                    11 => "[J",
                    _ => {
                        return Err(WriterError::FrameMerge {
                            method: self.method.to_owned(),
                            at: i,
                            msg: format!("bad newarray type {atype}"),
                        })
                    }
                };
                self.push(frame, VType::Object(desc.to_owned()));
                Ok(Flow::Next)
            }
            Insn::MultiNewArray { index, dims } => {
                self.popn(frame, *dims as usize, i)?;
                let name = self.class_name_at(*index)?;
                self.push(frame, VType::Object(name));
                Ok(Flow::Next)
            }
            Insn::Plain(pop) => self.exec_plain(i, *pop, frame),
        }
    }

    fn exec_local(
        &mut self,
        i: usize,
        lop: u8,
        slot: u16,
        frame: &mut Frame,
    ) -> Result<Flow, WriterError> {
        match lop {
            op::ILOAD => self.push(frame, VType::Int),
            op::LLOAD => self.push(frame, VType::Long),
            op::FLOAD => self.push(frame, VType::Float),
            op::DLOAD => self.push(frame, VType::Double),
            op::ALOAD => {
                let v = self.load(frame, slot);
                self.push(frame, v);
            }
            op::ISTORE => {
                self.popn(frame, 1, i)?;
                self.store(frame, slot, VType::Int)?;
            }
            op::LSTORE => {
                self.popn(frame, 1, i)?;
                self.store(frame, slot, VType::Long)?;
            }
            op::FSTORE => {
                self.popn(frame, 1, i)?;
                self.store(frame, slot, VType::Float)?;
            }
            op::DSTORE => {
                self.popn(frame, 1, i)?;
                self.store(frame, slot, VType::Double)?;
            }
            op::ASTORE => {
                let v = self.pop(frame, i)?;
                self.store(frame, slot, v)?;
            }
            op::RET => return Ok(Flow::Stop),
            other => {
                return Err(WriterError::FrameMerge {
                    method: self.method.to_owned(),
                    at: i,
                    msg: format!("unexpected local opcode 0x{other:02x}"),
                })
            }
        }
        if matches!(lop, op::ILOAD..=op::ALOAD) {
            let width = if matches!(lop, op::LLOAD | op::DLOAD) {
                2
            } else {
                1
            };
            self.use_local(slot, width)?;
        }
        Ok(Flow::Next)
    }

    fn exec_cp(
        &mut self,
        i: usize,
        cop: u8,
        index: u16,
        frame: &mut Frame,
    ) -> Result<Flow, WriterError> {
        match cop {
            op::GETSTATIC | op::GETFIELD => {
                if cop == op::GETFIELD {
                    self.popn(frame, 1, i)?;
                }
                let v = self.field_type(index)?;
                self.push(frame, v);
            }
            op::PUTSTATIC | op::PUTFIELD => {
                self.popn(frame, 1, i)?;
                if cop == op::PUTFIELD {
                    self.popn(frame, 1, i)?;
                }
            }
            op::INVOKEVIRTUAL | op::INVOKESTATIC => {
                self.invoke(i, index, cop == op::INVOKEVIRTUAL, frame)?;
            }
            op::INVOKESPECIAL => {
                let (_, name, descriptor) =
                    self.model
                        .pool
                        .member_ref(index)
                        .ok_or(WriterError::DanglingIndex {
                            index,
                            context: "invokespecial",
                        })?;
                let name = name.to_owned();
                let descriptor = descriptor.to_owned();
                if name == "<init>" {
                    self.call(i, &descriptor, false, frame)?;
                    let receiver = self.pop(frame, i)?;
                    self.initialize(frame, &receiver)?;
                } else {
                    // Private and super calls consume the receiver and push
                    // the return value, same as invokevirtual.
                    self.call(i, &descriptor, true, frame)?;
                }
            }
            op::NEW => {
                self.push(frame, VType::Uninit(i));
            }
            op::ANEWARRAY => {
                self.popn(frame, 1, i)?;
                let name = self.class_name_at(index)?;
                let desc = if name.starts_with('[') {
                    format!("[{name}")
                } else {
                    format!("[L{name};")
                };
                self.push(frame, VType::Object(desc));
            }
            op::CHECKCAST => {
                self.popn(frame, 1, i)?;
                let name = self.class_name_at(index)?;
                self.push(frame, VType::Object(name));
            }
            op::INSTANCEOF => {
                self.popn(frame, 1, i)?;
                self.push(frame, VType::Int);
            }
            other => {
                return Err(WriterError::FrameMerge {
                    method: self.method.to_owned(),
                    at: i,
                    msg: format!("unexpected pool opcode 0x{other:02x}"),
                })
            }
        }
        Ok(Flow::Next)
    }

    fn exec_plain(&mut self, i: usize, pop: u8, frame: &mut Frame) -> Result<Flow, WriterError> {
        match pop {
            op::NOP => {}
            op::ACONST_NULL => self.push(frame, VType::Null),
            op::ICONST_M1..=op::ICONST_5 => self.push(frame, VType::Int),
            op::LCONST_0 | op::LCONST_1 => self.push(frame, VType::Long),
            op::FCONST_0..=op::FCONST_2 => self.push(frame, VType::Float),
            op::DCONST_0 | op::DCONST_1 => self.push(frame, VType::Double),
            // Array loads.
            0x2e..=0x35 => {
                self.popn(frame, 1, i)?;
                let array = self.pop(frame, i)?;
                let v = match pop {
                    0x2e | 0x33..=0x35 => VType::Int,
                    0x2f => VType::Long,
                    0x30 => VType::Float,
                    0x31 => VType::Double,
                    // aaload: element type from the array descriptor.
                    _ => match array {
                        VType::Object(desc) if desc.starts_with('[') => {
                            element_type(&desc)
                        }
                        VType::Null => VType::Null,
                        _ => VType::Object("java/lang/Object".to_owned()),
                    },
                };
                self.push(frame, v);
            }
            // Array stores.
            0x4f..=0x56 => self.popn(frame, 3, i)?,
            op::POP => self.popn(frame, 1, i)?,
            op::POP2 => {
                self.pop_group2(frame, i)?;
            }
            op::DUP => {
                let v = self.pop(frame, i)?;
                self.push(frame, v.clone());
                self.push(frame, v);
            }
            op::DUP_X1 => {
                let v1 = self.pop(frame, i)?;
                let v2 = self.pop(frame, i)?;
                self.push(frame, v1.clone());
                self.push(frame, v2);
                self.push(frame, v1);
            }
            op::DUP_X2 => {
                let v1 = self.pop(frame, i)?;
                let group = self.pop_group2(frame, i)?;
                self.push(frame, v1.clone());
                for v in group {
                    self.push(frame, v);
                }
                self.push(frame, v1);
            }
            op::DUP2 => {
                let group = self.pop_group2(frame, i)?;
                for v in &group {
                    self.push(frame, v.clone());
                }
                for v in group {
                    self.push(frame, v);
                }
            }
            op::DUP2_X1 => {
                let group = self.pop_group2(frame, i)?;
                let below = self.pop(frame, i)?;
                for v in &group {
                    self.push(frame, v.clone());
                }
                self.push(frame, below);
                for v in group {
                    self.push(frame, v);
                }
            }
            op::DUP2_X2 => {
                let g1 = self.pop_group2(frame, i)?;
                let g2 = self.pop_group2(frame, i)?;
                for v in &g1 {
                    self.push(frame, v.clone());
                }
                for v in g2 {
                    self.push(frame, v);
                }
                for v in g1 {
                    self.push(frame, v);
                }
            }
            op::SWAP => {
                let v1 = self.pop(frame, i)?;
                let v2 = self.pop(frame, i)?;
                self.push(frame, v1);
                self.push(frame, v2);
            }
            // Binary arithmetic: iadd .. drem cycle through int/long/float/double.
            0x60..=0x73 => {
                let t = arith_type(pop - 0x60);
                self.popn(frame, 2, i)?;
                self.push(frame, t);
            }
            // Negation.
            0x74..=0x77 => {
                let t = arith_type(pop - 0x74);
                self.popn(frame, 1, i)?;
                self.push(frame, t);
            }
            // Shifts: value op amount, result follows the value type.
            0x78..=0x7d => {
                let t = if (pop - 0x78) % 2 == 0 {
                    VType::Int
                } else {
                    VType::Long
                };
                self.popn(frame, 2, i)?;
                self.push(frame, t);
            }
            // Bitwise and/or/xor.
            0x7e..=0x83 => {
                let t = if (pop - 0x7e) % 2 == 0 {
                    VType::Int
                } else {
                    VType::Long
                };
                self.popn(frame, 2, i)?;
                self.push(frame, t);
            }
            // Conversions: i2l .. i2s.
            0x85..=0x93 => {
                self.popn(frame, 1, i)?;
                let t = match pop {
                    0x85 | 0x8c | 0x8f => VType::Long,
                    0x86 | 0x89 | 0x90 => VType::Float,
                    0x87 | 0x8a | 0x8d => VType::Double,
                    _ => VType::Int,
                };
                self.push(frame, t);
            }
            op::LCMP | op::FCMPL..=op::DCMPG => {
                self.popn(frame, 2, i)?;
                self.push(frame, VType::Int);
            }
            op::IRETURN..=op::ARETURN => {
                self.popn(frame, 1, i)?;
                return Ok(Flow::Stop);
            }
            op::RETURN => return Ok(Flow::Stop),
            op::ARRAYLENGTH => {
                self.popn(frame, 1, i)?;
                self.push(frame, VType::Int);
            }
            op::ATHROW => {
                self.popn(frame, 1, i)?;
                return Ok(Flow::Stop);
            }
            op::MONITORENTER | op::MONITOREXIT => self.popn(frame, 1, i)?,
            other => {
                return Err(WriterError::FrameMerge {
                    method: self.method.to_owned(),
                    at: i,
                    msg: format!("unmodeled opcode 0x{other:02x}"),
                })
            }
        }
        Ok(Flow::Next)
    }

    /// Replaces every occurrence of an uninitialized value with its
    /// constructed type after `invokespecial <init>`.
    fn initialize(&mut self, frame: &mut Frame, receiver: &VType) -> Result<(), WriterError> {
        let initialized = match receiver {
            VType::Uninit(new_idx) => match &self.code[*new_idx] {
                Insn::Cp { op: op::NEW, index } => VType::Object(self.class_name_at(*index)?),
                _ => VType::Object("java/lang/Object".to_owned()),
            },
            VType::UninitThis => VType::Object(
                self.model
                    .this_class_name()
                    .unwrap_or("java/lang/Object")
                    .to_owned(),
            ),
            // Re-initializing an already-constructed value (e.g. a plain
            // super call through an Object receiver) changes nothing.
            _ => return Ok(()),
        };
        for v in frame.locals.iter_mut().chain(frame.stack.iter_mut()) {
            if v == receiver {
                *v = initialized.clone();
            }
        }
        Ok(())
    }

    fn invoke(
        &mut self,
        i: usize,
        index: u16,
        has_receiver: bool,
        frame: &mut Frame,
    ) -> Result<(), WriterError> {
        let (_, _, descriptor) =
            self.model
                .pool
                .member_ref(index)
                .ok_or(WriterError::DanglingIndex {
                    index,
                    context: "invocation",
                })?;
        let descriptor = descriptor.to_owned();
        self.call(i, &descriptor, has_receiver, frame)
    }

    fn call(
        &mut self,
        i: usize,
        descriptor: &str,
        has_receiver: bool,
        frame: &mut Frame,
    ) -> Result<(), WriterError> {
        let (params, ret) = parse_method_descriptor(descriptor)?;
        self.popn(frame, params.len(), i)?;
        if has_receiver {
            self.popn(frame, 1, i)?;
        }
        if let Some(v) = ret {
            self.push(frame, v);
        }
        Ok(())
    }

    fn field_type(&self, index: u16) -> Result<VType, WriterError> {
        let (_, _, descriptor) =
            self.model
                .pool
                .member_ref(index)
                .ok_or(WriterError::DanglingIndex {
                    index,
                    context: "field access",
                })?;
        let (v, rest) = parse_field_descriptor(descriptor)?;
        if !rest.is_empty() {
            return Err(WriterError::BadDescriptor(descriptor.to_owned()));
        }
        Ok(v)
    }

    fn loadable_type(&self, index: u16, wide: bool) -> Result<VType, WriterError> {
        let entry = self.model.pool.get(index).ok_or(WriterError::DanglingIndex {
            index,
            context: "ldc",
        })?;
        Ok(match entry {
            ConstEntry::Integer(_) => VType::Int,
            ConstEntry::Float(_) => VType::Float,
            ConstEntry::Long(_) => VType::Long,
            ConstEntry::Double(_) => VType::Double,
            ConstEntry::Str { .. } => VType::Object("java/lang/String".to_owned()),
            ConstEntry::Class { .. } => VType::Object("java/lang/Class".to_owned()),
            ConstEntry::MethodType { .. } => {
                VType::Object("java/lang/invoke/MethodType".to_owned())
            }
            ConstEntry::MethodHandle { .. } => {
                VType::Object("java/lang/invoke/MethodHandle".to_owned())
            }
            ConstEntry::Dynamic { .. } => {
                let descriptor =
                    self.model
                        .pool
                        .dynamic_descriptor(index)
                        .ok_or(WriterError::DanglingIndex {
                            index,
                            context: "condy",
                        })?;
                parse_field_descriptor(descriptor)?.0
            }
            _ => {
                return Err(WriterError::TagMismatch {
                    index,
                    context: if wide { "ldc2_w" } else { "ldc" },
                })
            }
        })
    }

    fn class_name_at(&self, index: u16) -> Result<String, WriterError> {
        self.model
            .pool
            .class_name(index)
            .map(str::to_owned)
            .ok_or(WriterError::DanglingIndex {
                index,
                context: "class reference",
            })
    }
}

const fn arith_type(cycle: u8) -> VType {
    match cycle % 4 {
        0 => VType::Int,
        1 => VType::Long,
        2 => VType::Float,
        _ => VType::Double,
    }
}

fn element_type(array_desc: &str) -> VType {
    let inner = &array_desc[1..];
    match inner.as_bytes().first() {
        Some(b'L') => VType::Object(inner[1..inner.len() - 1].to_owned()),
        Some(b'[') => VType::Object(inner.to_owned()),
        Some(b'J') => VType::Long,
        Some(b'D') => VType::Double,
        Some(b'F') => VType::Float,
        _ => VType::Int,
    }
}

/// Parses one field descriptor, returning the type and the unconsumed rest.
pub(crate) fn parse_field_descriptor(desc: &str) -> Result<(VType, &str), WriterError> {
    let bytes = desc.as_bytes();
    match bytes.first() {
        Some(b'B' | b'C' | b'I' | b'S' | b'Z') => Ok((VType::Int, &desc[1..])),
        Some(b'F') => Ok((VType::Float, &desc[1..])),
        Some(b'J') => Ok((VType::Long, &desc[1..])),
        Some(b'D') => Ok((VType::Double, &desc[1..])),
        Some(b'L') => {
            let end = desc
                .find(';')
                .ok_or_else(|| WriterError::BadDescriptor(desc.to_owned()))?;
            Ok((VType::Object(desc[1..end].to_owned()), &desc[end + 1..]))
        }
        Some(b'[') => {
            let mut depth = 0;
            while bytes.get(depth) == Some(&b'[') {
                depth += 1;
            }
            let (_, rest) = parse_field_descriptor(&desc[depth..])?;
            let consumed = desc.len() - rest.len();
            Ok((VType::Object(desc[..consumed].to_owned()), rest))
        }
        _ => Err(WriterError::BadDescriptor(desc.to_owned())),
    }
}

/// Parses a method descriptor into parameter types and an optional return.
pub(crate) fn parse_method_descriptor(
    desc: &str,
) -> Result<(Vec<VType>, Option<VType>), WriterError> {
    let inner = desc
        .strip_prefix('(')
        .ok_or_else(|| WriterError::BadDescriptor(desc.to_owned()))?;
    let close = inner
        .find(')')
        .ok_or_else(|| WriterError::BadDescriptor(desc.to_owned()))?;
    let (mut params_str, ret_str) = (&inner[..close], &inner[close + 1..]);
    let mut params = Vec::new();
    while !params_str.is_empty() {
        let (v, rest) = parse_field_descriptor(params_str)?;
        params.push(v);
        params_str = rest;
    }
    let ret = if ret_str == "V" {
        None
    } else {
        let (v, rest) = parse_field_descriptor(ret_str)?;
        if !rest.is_empty() {
            return Err(WriterError::BadDescriptor(desc.to_owned()));
        }
        Some(v)
    };
    Ok((params, ret))
}
