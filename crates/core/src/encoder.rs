//! Serializes a [`ClassModel`] back into class bytes.
//!
//! Encoding is a five-step pipeline: verify the structural invariants,
//! analyze every method body, compact and renumber the constant pool, lay
//! each body out to a fixed point, then serialize. The emitted pool contains
//! only entries something still references, so constants a mutation replaced
//! disappear here without any bookkeeping in the mutators themselves.

use crate::constpool::{ConstEntry, ConstPool};
use crate::frames::{self, MethodFacts, VType};
use crate::model::{ClassModel, Insn, Label, Member, MethodBody, ACC_ABSTRACT, ACC_NATIVE};
use crate::opcode as op;
use classcloak_utils::errors::WriterError;
use std::collections::{HashMap, HashSet};
use tracing::debug;

const CODE_LIMIT: usize = u16::MAX as usize;
const POOL_LIMIT: usize = u16::MAX as usize;
/// First class-file version whose methods must carry stack map frames.
const FRAMES_SINCE_MAJOR: u16 = 50;

/// Encodes `model` into class-file bytes.
pub fn encode(model: &ClassModel) -> Result<Vec<u8>, WriterError> {
    model.verify()?;

    let mut facts = Vec::with_capacity(model.methods.len());
    for member in &model.methods {
        match &member.body {
            Some(body) => facts.push(Some(frames::analyze(model, member, body)?)),
            None => facts.push(None),
        }
    }

    let emit_frames = model.major >= FRAMES_SINCE_MAJOR;
    let mut pool = model.pool.clone();
    let names = AttrNames::intern(model, &facts, emit_frames, &mut pool);
    let frame_classes = intern_frame_classes(model, &facts, emit_frames, &mut pool);

    let pm = compact(model, &pool, &names, &frame_classes)?;
    debug!(
        before = pool.slot_count(),
        after = pm.new_count,
        "compacted constant pool"
    );

    let mut out = Out::default();
    out.u4(0xcafe_babe);
    out.u2(model.minor);
    out.u2(model.major);
    write_pool(&mut out, &pool, &pm)?;

    out.u2(model.access);
    out.u2(pm.map(model.this_class)?);
    out.u2(if model.super_class == 0 {
        0
    } else {
        pm.map(model.super_class)?
    });
    out.u2(len16(model.interfaces.len(), "interface count")?);
    for &iface in &model.interfaces {
        out.u2(pm.map(iface)?);
    }

    out.u2(len16(model.fields.len(), "field count")?);
    for field in &model.fields {
        write_field(&mut out, model, field, &names, &pm)?;
    }

    out.u2(len16(model.methods.len(), "method count")?);
    for (member, mf) in model.methods.iter().zip(&facts) {
        write_method(
            &mut out,
            model,
            member,
            mf.as_ref(),
            emit_frames,
            &names,
            &frame_classes,
            &pm,
        )?;
    }

    write_class_attributes(&mut out, model, &names, &pm)?;
    Ok(out.0)
}

/// Pool indices of the attribute-name strings the encoder emits. Each name is
/// interned only when the class actually needs the attribute, so compaction
/// never keeps a dead name alive.
#[derive(Default)]
struct AttrNames {
    code: Option<u16>,
    constant_value: Option<u16>,
    exceptions: Option<u16>,
    signature: Option<u16>,
    source_file: Option<u16>,
    bootstrap_methods: Option<u16>,
    nest_host: Option<u16>,
    nest_members: Option<u16>,
    inner_classes: Option<u16>,
    enclosing_method: Option<u16>,
    line_numbers: Option<u16>,
    local_vars: Option<u16>,
    stack_map: Option<u16>,
    raw: HashMap<String, u16>,
}

impl AttrNames {
    fn intern(
        model: &ClassModel,
        facts: &[Option<MethodFacts>],
        emit_frames: bool,
        pool: &mut ConstPool,
    ) -> Self {
        let mut names = Self::default();
        if model.methods.iter().any(|m| m.body.is_some()) {
            names.code = Some(pool.intern_utf8("Code"));
        }
        if model.fields.iter().any(|f| f.constant_value.is_some()) {
            names.constant_value = Some(pool.intern_utf8("ConstantValue"));
        }
        if model.methods.iter().any(|m| !m.throws.is_empty()) {
            names.exceptions = Some(pool.intern_utf8("Exceptions"));
        }
        let any_signature = model.signature.is_some()
            || model
                .fields
                .iter()
                .chain(&model.methods)
                .any(|m| m.signature.is_some());
        if any_signature {
            names.signature = Some(pool.intern_utf8("Signature"));
        }
        if model.source_file.is_some() {
            names.source_file = Some(pool.intern_utf8("SourceFile"));
        }
        if !model.bootstrap_methods.is_empty() {
            names.bootstrap_methods = Some(pool.intern_utf8("BootstrapMethods"));
        }
        if model.nest_host.is_some() {
            names.nest_host = Some(pool.intern_utf8("NestHost"));
        }
        if !model.nest_members.is_empty() {
            names.nest_members = Some(pool.intern_utf8("NestMembers"));
        }
        if !model.inner_classes.is_empty() {
            names.inner_classes = Some(pool.intern_utf8("InnerClasses"));
        }
        if model.enclosing_method.is_some() {
            names.enclosing_method = Some(pool.intern_utf8("EnclosingMethod"));
        }
        let bodies = || model.methods.iter().filter_map(|m| m.body.as_ref());
        if bodies().any(|b| !b.line_numbers.is_empty()) {
            names.line_numbers = Some(pool.intern_utf8("LineNumberTable"));
        }
        if bodies().any(|b| !b.local_vars.is_empty()) {
            names.local_vars = Some(pool.intern_utf8("LocalVariableTable"));
        }
        if emit_frames && facts.iter().flatten().any(|f| !f.frames.is_empty()) {
            names.stack_map = Some(pool.intern_utf8("StackMapTable"));
        }
        let raw_names = model
            .attrs
            .keys()
            .chain(model.fields.iter().flat_map(|f| f.attrs.keys()))
            .chain(model.methods.iter().flat_map(|m| m.attrs.keys()));
        for name in raw_names {
            if !names.raw.contains_key(name) {
                let idx = pool.intern_utf8(name);
                names.raw.insert(name.clone(), idx);
            }
        }
        names
    }

    fn raw_index(&self, name: &str) -> Result<u16, WriterError> {
        self.raw
            .get(name)
            .copied()
            .ok_or(WriterError::DanglingIndex {
                index: 0,
                context: "attribute name",
            })
    }
}

/// Interns a `Class` entry for every reference type the regenerated frames
/// can mention, returning name to index. Besides the frames at labels this
/// covers the fall-through state after each conditional branch, since branch
/// widening can turn that point into a target of its own.
fn intern_frame_classes(
    model: &ClassModel,
    facts: &[Option<MethodFacts>],
    emit_frames: bool,
    pool: &mut ConstPool,
) -> HashMap<String, u16> {
    let mut classes = HashMap::new();
    if !emit_frames {
        return classes;
    }
    let mut visit = |frame: &crate::frames::Frame, pool: &mut ConstPool| {
        for v in frame.locals.iter().chain(&frame.stack) {
            if let VType::Object(name) = v {
                if !classes.contains_key(name) {
                    let idx = pool.intern_class(name);
                    classes.insert(name.clone(), idx);
                }
            }
        }
    };
    for (member, mf) in model.methods.iter().zip(facts) {
        let (Some(body), Some(mf)) = (&member.body, mf) else {
            continue;
        };
        for (_, frame) in &mf.frames {
            visit(frame, pool);
        }
        for (i, insn) in body.code.iter().enumerate() {
            if let Insn::Branch { op: bop, .. } = insn {
                if op::is_conditional(*bop) {
                    if let Some(Some(frame)) = mf.entry_frames.get(i + 1) {
                        visit(frame, pool);
                    }
                }
            }
        }
    }
    classes
}

/// Old-index to new-index mapping produced by pool compaction.
struct PoolMap {
    map: Vec<u16>,
    new_count: usize,
}

impl PoolMap {
    fn map(&self, index: u16) -> Result<u16, WriterError> {
        match self.map.get(index as usize) {
            Some(&new) if new != 0 => Ok(new),
            _ => Err(WriterError::DanglingIndex {
                index,
                context: "pool compaction",
            }),
        }
    }
}

/// Marks every entry the model still references, closes over intra-pool
/// references, and assigns dense new indices.
fn compact(
    model: &ClassModel,
    pool: &ConstPool,
    names: &AttrNames,
    frame_classes: &HashMap<String, u16>,
) -> Result<PoolMap, WriterError> {
    let mut live = vec![false; pool.slot_count()];
    let mut work = Vec::new();
    let mut root = |idx: u16, work: &mut Vec<u16>| {
        if idx != 0 {
            work.push(idx);
        }
    };

    root(model.this_class, &mut work);
    root(model.super_class, &mut work);
    for &iface in &model.interfaces {
        root(iface, &mut work);
    }
    if let Some(idx) = model.source_file {
        root(idx, &mut work);
    }
    if let Some(idx) = model.signature {
        root(idx, &mut work);
    }
    for bsm in &model.bootstrap_methods {
        root(bsm.method_ref, &mut work);
        for &arg in &bsm.args {
            root(arg, &mut work);
        }
    }
    if let Some(idx) = model.nest_host {
        root(idx, &mut work);
    }
    for &member in &model.nest_members {
        root(member, &mut work);
    }
    for inner in &model.inner_classes {
        root(inner.inner, &mut work);
        if let Some(idx) = inner.outer {
            root(idx, &mut work);
        }
        if let Some(idx) = inner.name {
            root(idx, &mut work);
        }
    }
    if let Some((owner, method)) = model.enclosing_method {
        root(owner, &mut work);
        if let Some(idx) = method {
            root(idx, &mut work);
        }
    }
    for member in model.fields.iter().chain(&model.methods) {
        root(member.name, &mut work);
        root(member.descriptor, &mut work);
        if let Some(idx) = member.signature {
            root(idx, &mut work);
        }
        if let Some(idx) = member.constant_value {
            root(idx, &mut work);
        }
        for &thrown in &member.throws {
            root(thrown, &mut work);
        }
        if let Some(body) = &member.body {
            for insn in &body.code {
                match insn {
                    Insn::Ldc(idx)
                    | Insn::Ldc2(idx)
                    | Insn::Cp { index: idx, .. }
                    | Insn::InvokeInterface { index: idx, .. }
                    | Insn::InvokeDynamic { index: idx }
                    | Insn::MultiNewArray { index: idx, .. } => root(*idx, &mut work),
                    _ => {}
                }
            }
            for range in &body.exceptions {
                if let Some(idx) = range.catch_type {
                    root(idx, &mut work);
                }
            }
            for var in &body.local_vars {
                root(var.name, &mut work);
                root(var.descriptor, &mut work);
            }
        }
    }
    for idx in [
        names.code,
        names.constant_value,
        names.exceptions,
        names.signature,
        names.source_file,
        names.bootstrap_methods,
        names.nest_host,
        names.nest_members,
        names.inner_classes,
        names.enclosing_method,
        names.line_numbers,
        names.local_vars,
        names.stack_map,
    ]
    .into_iter()
    .flatten()
    {
        root(idx, &mut work);
    }
    for &idx in names.raw.values() {
        root(idx, &mut work);
    }
    for &idx in frame_classes.values() {
        root(idx, &mut work);
    }

    while let Some(idx) = work.pop() {
        let slot = idx as usize;
        if slot >= live.len() || live[slot] {
            continue;
        }
        live[slot] = true;
        let entry = pool.get(idx).ok_or(WriterError::DanglingIndex {
            index: idx,
            context: "pool compaction",
        })?;
        match entry {
            ConstEntry::Class { name }
            | ConstEntry::Str { utf8: name }
            | ConstEntry::MethodType { descriptor: name }
            | ConstEntry::Module { name }
            | ConstEntry::Package { name } => root(*name, &mut work),
            ConstEntry::FieldRef {
                class,
                name_and_type,
            }
            | ConstEntry::MethodRef {
                class,
                name_and_type,
            }
            | ConstEntry::InterfaceMethodRef {
                class,
                name_and_type,
            } => {
                root(*class, &mut work);
                root(*name_and_type, &mut work);
            }
            ConstEntry::NameAndType { name, descriptor } => {
                root(*name, &mut work);
                root(*descriptor, &mut work);
            }
            ConstEntry::MethodHandle { reference, .. } => root(*reference, &mut work),
            ConstEntry::Dynamic { name_and_type, .. }
            | ConstEntry::InvokeDynamic { name_and_type, .. } => root(*name_and_type, &mut work),
            _ => {}
        }
    }

    let mut map = vec![0u16; pool.slot_count()];
    let mut next = 1usize;
    for (idx, slot) in pool.slots().iter().enumerate() {
        let Some(entry) = slot else { continue };
        if !live[idx] {
            continue;
        }
        map[idx] = next as u16;
        next += if entry.is_wide() { 2 } else { 1 };
        if next > POOL_LIMIT {
            return Err(WriterError::PoolOverflow(next));
        }
    }
    Ok(PoolMap {
        map,
        new_count: next,
    })
}

fn write_pool(out: &mut Out, pool: &ConstPool, pm: &PoolMap) -> Result<(), WriterError> {
    out.u2(pm.new_count as u16);
    for (idx, slot) in pool.slots().iter().enumerate() {
        let Some(entry) = slot else { continue };
        if pm.map[idx] == 0 {
            continue;
        }
        out.u1(entry.tag());
        match entry {
            ConstEntry::Utf8(s) => {
                let bytes = encode_mutf8(s);
                out.u2(len16(bytes.len(), "Utf8 byte length")?);
                out.bytes(&bytes);
            }
            ConstEntry::Integer(v) => out.u4(*v as u32),
            ConstEntry::Float(bits) => out.u4(*bits),
            ConstEntry::Long(v) => out.u8v(*v as u64),
            ConstEntry::Double(bits) => out.u8v(*bits),
            ConstEntry::Class { name }
            | ConstEntry::Str { utf8: name }
            | ConstEntry::MethodType { descriptor: name }
            | ConstEntry::Module { name }
            | ConstEntry::Package { name } => out.u2(pm.map(*name)?),
            ConstEntry::FieldRef {
                class,
                name_and_type,
            }
            | ConstEntry::MethodRef {
                class,
                name_and_type,
            }
            | ConstEntry::InterfaceMethodRef {
                class,
                name_and_type,
            } => {
                out.u2(pm.map(*class)?);
                out.u2(pm.map(*name_and_type)?);
            }
            ConstEntry::NameAndType { name, descriptor } => {
                out.u2(pm.map(*name)?);
                out.u2(pm.map(*descriptor)?);
            }
            ConstEntry::MethodHandle { kind, reference } => {
                out.u1(*kind);
                out.u2(pm.map(*reference)?);
            }
            ConstEntry::Dynamic {
                bootstrap,
                name_and_type,
            }
            | ConstEntry::InvokeDynamic {
                bootstrap,
                name_and_type,
            } => {
                out.u2(*bootstrap);
                out.u2(pm.map(*name_and_type)?);
            }
        }
    }
    Ok(())
}

fn write_field(
    out: &mut Out,
    model: &ClassModel,
    field: &Member,
    names: &AttrNames,
    pm: &PoolMap,
) -> Result<(), WriterError> {
    out.u2(field.access);
    out.u2(pm.map(field.name)?);
    out.u2(pm.map(field.descriptor)?);

    let count = usize::from(field.constant_value.is_some())
        + usize::from(field.signature.is_some())
        + field.attrs.len();
    out.u2(len16(count, "field attribute count")?);
    if let Some(value) = field.constant_value {
        write_attr_u2(out, names.constant_value, pm.map(value)?)?;
    }
    if let Some(sig) = field.signature {
        write_attr_u2(out, names.signature, pm.map(sig)?)?;
    }
    write_raw_attrs(out, model, field, names)?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn write_method(
    out: &mut Out,
    model: &ClassModel,
    member: &Member,
    facts: Option<&MethodFacts>,
    emit_frames: bool,
    names: &AttrNames,
    frame_classes: &HashMap<String, u16>,
    pm: &PoolMap,
) -> Result<(), WriterError> {
    out.u2(member.access);
    out.u2(pm.map(member.name)?);
    out.u2(pm.map(member.descriptor)?);

    let concrete = member.access & (ACC_ABSTRACT | ACC_NATIVE) == 0;
    let has_code = concrete && member.body.is_some();
    let count = usize::from(has_code)
        + usize::from(!member.throws.is_empty())
        + usize::from(member.signature.is_some())
        + member.attrs.len();
    out.u2(len16(count, "method attribute count")?);

    if has_code {
        let body = member.body.as_ref().ok_or(WriterError::DanglingIndex {
            index: member.name,
            context: "method body",
        })?;
        let facts = facts.ok_or(WriterError::DanglingIndex {
            index: member.name,
            context: "method analysis",
        })?;
        let payload = encode_code(model, member, body, facts, emit_frames, names, frame_classes, pm)?;
        write_attr(out, names.code, &payload)?;
    }
    if !member.throws.is_empty() {
        let mut payload = Out::default();
        payload.u2(len16(member.throws.len(), "Exceptions count")?);
        for &thrown in &member.throws {
            payload.u2(pm.map(thrown)?);
        }
        write_attr(out, names.exceptions, &payload.0)?;
    }
    if let Some(sig) = member.signature {
        write_attr_u2(out, names.signature, pm.map(sig)?)?;
    }
    write_raw_attrs(out, model, member, names)?;
    Ok(())
}

fn write_class_attributes(
    out: &mut Out,
    model: &ClassModel,
    names: &AttrNames,
    pm: &PoolMap,
) -> Result<(), WriterError> {
    let count = usize::from(model.source_file.is_some())
        + usize::from(model.signature.is_some())
        + usize::from(!model.bootstrap_methods.is_empty())
        + usize::from(model.nest_host.is_some())
        + usize::from(!model.nest_members.is_empty())
        + usize::from(!model.inner_classes.is_empty())
        + usize::from(model.enclosing_method.is_some())
        + model.attrs.len();
    out.u2(len16(count, "class attribute count")?);

    if let Some(idx) = model.source_file {
        write_attr_u2(out, names.source_file, pm.map(idx)?)?;
    }
    if let Some(idx) = model.signature {
        write_attr_u2(out, names.signature, pm.map(idx)?)?;
    }
    if !model.bootstrap_methods.is_empty() {
        let mut payload = Out::default();
        payload.u2(len16(model.bootstrap_methods.len(), "bootstrap count")?);
        for bsm in &model.bootstrap_methods {
            payload.u2(pm.map(bsm.method_ref)?);
            payload.u2(len16(bsm.args.len(), "bootstrap argument count")?);
            for &arg in &bsm.args {
                payload.u2(pm.map(arg)?);
            }
        }
        write_attr(out, names.bootstrap_methods, &payload.0)?;
    }
    if !model.inner_classes.is_empty() {
        let mut payload = Out::default();
        payload.u2(len16(model.inner_classes.len(), "inner class count")?);
        for inner in &model.inner_classes {
            payload.u2(pm.map(inner.inner)?);
            payload.u2(match inner.outer {
                Some(idx) => pm.map(idx)?,
                None => 0,
            });
            payload.u2(match inner.name {
                Some(idx) => pm.map(idx)?,
                None => 0,
            });
            payload.u2(inner.access);
        }
        write_attr(out, names.inner_classes, &payload.0)?;
    }
    if let Some((owner, method)) = model.enclosing_method {
        let mut payload = Out::default();
        payload.u2(pm.map(owner)?);
        payload.u2(match method {
            Some(idx) => pm.map(idx)?,
            None => 0,
        });
        write_attr(out, names.enclosing_method, &payload.0)?;
    }
    if let Some(idx) = model.nest_host {
        write_attr_u2(out, names.nest_host, pm.map(idx)?)?;
    }
    if !model.nest_members.is_empty() {
        let mut payload = Out::default();
        payload.u2(len16(model.nest_members.len(), "nest member count")?);
        for &member in &model.nest_members {
            payload.u2(pm.map(member)?);
        }
        write_attr(out, names.nest_members, &payload.0)?;
    }
    for (name, payload) in &model.attrs {
        out.u2(names.raw_index(name)?);
        out.u4(payload.len() as u32);
        out.bytes(payload);
    }
    Ok(())
}

fn write_raw_attrs(
    out: &mut Out,
    _model: &ClassModel,
    member: &Member,
    names: &AttrNames,
) -> Result<(), WriterError> {
    for (name, payload) in &member.attrs {
        out.u2(names.raw_index(name)?);
        out.u4(payload.len() as u32);
        out.bytes(payload);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Code attribute
// ---------------------------------------------------------------------------

/// Per-instruction layout decided for one body: final byte offsets plus the
/// set of branches forced into their wide encoding.
struct Layout {
    /// Byte offset of each code element, index-aligned with `body.code`, with
    /// one extra entry for the end of the code array.
    offsets: Vec<usize>,
    wide_branches: HashSet<usize>,
    len: usize,
}

#[allow(clippy::too_many_arguments)]
fn encode_code(
    model: &ClassModel,
    member: &Member,
    body: &MethodBody,
    facts: &MethodFacts,
    emit_frames: bool,
    names: &AttrNames,
    frame_classes: &HashMap<String, u16>,
    pm: &PoolMap,
) -> Result<Vec<u8>, WriterError> {
    let method = model.member_name(member).to_owned();
    let layout = lay_out(body, pm, &method)?;
    let label_offset = resolve_labels(body, &layout.offsets);
    let at = |label: Label| -> Result<u16, WriterError> {
        label_offset
            .get(&label)
            .map(|&o| o as u16)
            .ok_or(WriterError::UnresolvedLabel(label.0))
    };

    let code = emit_body(body, &layout, &label_offset, pm)?;
    debug_assert_eq!(code.len(), layout.len);

    let mut payload = Out::default();
    payload.u2(facts.max_stack);
    payload.u2(facts.max_locals);
    payload.u4(code.len() as u32);
    payload.bytes(&code);

    payload.u2(len16(body.exceptions.len(), "exception table length")?);
    for range in &body.exceptions {
        payload.u2(at(range.start)?);
        payload.u2(at(range.end)?);
        payload.u2(at(range.handler)?);
        payload.u2(match range.catch_type {
            Some(idx) => pm.map(idx)?,
            None => 0,
        });
    }

    let smt = if emit_frames && !facts.frames.is_empty() {
        Some(encode_stack_map(body, facts, &layout, frame_classes, &method)?)
    } else {
        None
    };
    let count = usize::from(!body.line_numbers.is_empty())
        + usize::from(!body.local_vars.is_empty())
        + usize::from(smt.is_some());
    payload.u2(count as u16);

    if !body.line_numbers.is_empty() {
        let mut table = Out::default();
        table.u2(len16(body.line_numbers.len(), "line number count")?);
        for &(label, line) in &body.line_numbers {
            table.u2(at(label)?);
            table.u2(line);
        }
        write_attr(&mut payload, names.line_numbers, &table.0)?;
    }
    if !body.local_vars.is_empty() {
        let mut table = Out::default();
        table.u2(len16(body.local_vars.len(), "local variable count")?);
        for var in &body.local_vars {
            let start = at(var.start)?;
            let end = at(var.end)?;
            table.u2(start);
            table.u2(end.saturating_sub(start));
            table.u2(pm.map(var.name)?);
            table.u2(pm.map(var.descriptor)?);
            table.u2(var.slot);
        }
        write_attr(&mut payload, names.local_vars, &table.0)?;
    }
    if let Some(smt) = smt {
        write_attr(&mut payload, names.stack_map, &smt)?;
    }
    Ok(payload.0)
}

/// Computes instruction offsets, widening branches until a fixed point.
/// Offsets only grow between rounds, so the loop terminates once every
/// narrow branch still in use fits in 16 bits.
fn lay_out(body: &MethodBody, pm: &PoolMap, method: &str) -> Result<Layout, WriterError> {
    let mut wide_branches: HashSet<usize> = HashSet::new();
    loop {
        let mut offsets = Vec::with_capacity(body.code.len() + 1);
        let mut pos = 0usize;
        for (i, insn) in body.code.iter().enumerate() {
            offsets.push(pos);
            pos += insn_size(insn, pos, wide_branches.contains(&i), pm)?;
        }
        offsets.push(pos);

        let label_offset = resolve_labels(body, &offsets);
        let mut grew = false;
        for (i, insn) in body.code.iter().enumerate() {
            let Insn::Branch { target, .. } = insn else {
                continue;
            };
            if wide_branches.contains(&i) {
                continue;
            }
            let target_off = *label_offset
                .get(target)
                .ok_or(WriterError::UnresolvedLabel(target.0))?;
            let rel = target_off as i64 - offsets[i] as i64;
            if i16::try_from(rel).is_err() {
                wide_branches.insert(i);
                grew = true;
            }
        }
        if !grew {
            if pos == 0 || pos > CODE_LIMIT {
                return Err(WriterError::CodeOverflow {
                    method: method.to_owned(),
                    len: pos,
                });
            }
            return Ok(Layout {
                offsets,
                wide_branches,
                len: pos,
            });
        }
    }
}

fn resolve_labels(body: &MethodBody, offsets: &[usize]) -> HashMap<Label, usize> {
    let mut map = HashMap::new();
    for (i, insn) in body.code.iter().enumerate() {
        if let Insn::Mark(label) = insn {
            map.insert(*label, offsets[i]);
        }
    }
    map
}

fn insn_size(insn: &Insn, pos: usize, wide: bool, pm: &PoolMap) -> Result<usize, WriterError> {
    Ok(match insn {
        Insn::Mark(_) => 0,
        Insn::Plain(_) => 1,
        Insn::Push8(_) => 2,
        Insn::Push16(_) => 3,
        Insn::Ldc(idx) => {
            if pm.map(*idx)? <= u8::MAX as u16 {
                2
            } else {
                3
            }
        }
        Insn::Ldc2(_) => 3,
        Insn::Local { op: lop, slot } => local_size(*lop, *slot),
        Insn::Iinc { slot, delta } => {
            if *slot <= u8::MAX as u16 && i8::try_from(*delta).is_ok() {
                3
            } else {
                6
            }
        }
        Insn::Branch { op: bop, .. } => match (*bop, wide) {
            (_, false) => 3,
            (op::GOTO | op::JSR, true) => 5,
            // Inverted conditional over a goto_w.
            (_, true) => 8,
        },
        Insn::Cp { .. } => 3,
        Insn::InvokeInterface { .. } | Insn::InvokeDynamic { .. } => 5,
        Insn::NewArray(_) => 2,
        Insn::MultiNewArray { .. } => 4,
        Insn::TableSwitch { targets, .. } => {
            1 + switch_pad(pos) + 12 + 4 * targets.len()
        }
        Insn::LookupSwitch { pairs, .. } => 1 + switch_pad(pos) + 8 + 8 * pairs.len(),
    })
}

/// Zero bytes inserted after a switch opcode so its operands are 4-aligned.
fn switch_pad(opcode_pos: usize) -> usize {
    (4 - (opcode_pos + 1) % 4) % 4
}

fn local_size(lop: u8, slot: u16) -> usize {
    let has_short_form = matches!(lop, op::ILOAD..=op::ALOAD | op::ISTORE..=op::ASTORE);
    if has_short_form && slot <= 3 {
        1
    } else if slot <= u8::MAX as u16 {
        2
    } else {
        4
    }
}

fn emit_body(
    body: &MethodBody,
    layout: &Layout,
    label_offset: &HashMap<Label, usize>,
    pm: &PoolMap,
) -> Result<Vec<u8>, WriterError> {
    let at = |label: &Label| -> Result<usize, WriterError> {
        label_offset
            .get(label)
            .copied()
            .ok_or(WriterError::UnresolvedLabel(label.0))
    };
    let mut out = Out::default();
    for (i, insn) in body.code.iter().enumerate() {
        let pos = layout.offsets[i];
        match insn {
            Insn::Mark(_) => {}
            Insn::Plain(opc) => out.u1(*opc),
            Insn::Push8(v) => {
                out.u1(op::BIPUSH);
                out.u1(*v as u8);
            }
            Insn::Push16(v) => {
                out.u1(op::SIPUSH);
                out.u2(*v as u16);
            }
            Insn::Ldc(idx) => {
                let mapped = pm.map(*idx)?;
                if mapped <= u8::MAX as u16 {
                    out.u1(op::LDC);
                    out.u1(mapped as u8);
                } else {
                    out.u1(op::LDC_W);
                    out.u2(mapped);
                }
            }
            Insn::Ldc2(idx) => {
                out.u1(op::LDC2_W);
                out.u2(pm.map(*idx)?);
            }
            Insn::Local { op: lop, slot } => emit_local(&mut out, *lop, *slot),
            Insn::Iinc { slot, delta } => {
                if *slot <= u8::MAX as u16 && i8::try_from(*delta).is_ok() {
                    out.u1(op::IINC);
                    out.u1(*slot as u8);
                    out.u1(*delta as u8);
                } else {
                    out.u1(op::WIDE);
                    out.u1(op::IINC);
                    out.u2(*slot);
                    out.u2(*delta as u16);
                }
            }
            Insn::Branch { op: bop, target } => {
                let target_off = at(target)? as i64;
                if !layout.wide_branches.contains(&i) {
                    let rel = target_off - pos as i64;
                    let rel = i16::try_from(rel).map_err(|_| WriterError::OffsetOverflow {
                        context: "narrow branch",
                        value: target_off as usize,
                    })?;
                    out.u1(*bop);
                    out.u2(rel as u16);
                } else if matches!(*bop, op::GOTO | op::JSR) {
                    out.u1(if *bop == op::GOTO { op::GOTO_W } else { op::JSR_W });
                    out.u4((target_off - pos as i64) as u32);
                } else {
                    // cond L  ==>  !cond skip; goto_w L; skip:
                    let inverted =
                        op::invert_conditional(*bop).ok_or(WriterError::OffsetOverflow {
                            context: "conditional branch",
                            value: target_off as usize,
                        })?;
                    out.u1(inverted);
                    out.u2(8);
                    out.u1(op::GOTO_W);
                    out.u4((target_off - (pos as i64 + 3)) as u32);
                }
            }
            Insn::Cp { op: cop, index } => {
                out.u1(*cop);
                out.u2(pm.map(*index)?);
            }
            Insn::InvokeInterface { index, count } => {
                out.u1(op::INVOKEINTERFACE);
                out.u2(pm.map(*index)?);
                out.u1(*count);
                out.u1(0);
            }
            Insn::InvokeDynamic { index } => {
                out.u1(op::INVOKEDYNAMIC);
                out.u2(pm.map(*index)?);
                out.u2(0);
            }
            Insn::NewArray(atype) => {
                out.u1(op::NEWARRAY);
                out.u1(*atype);
            }
            Insn::MultiNewArray { index, dims } => {
                out.u1(op::MULTIANEWARRAY);
                out.u2(pm.map(*index)?);
                out.u1(*dims);
            }
            Insn::TableSwitch {
                default,
                low,
                high,
                targets,
            } => {
                out.u1(op::TABLESWITCH);
                for _ in 0..switch_pad(pos) {
                    out.u1(0);
                }
                out.u4((at(default)? as i64 - pos as i64) as u32);
                out.u4(*low as u32);
                out.u4(*high as u32);
                for target in targets {
                    out.u4((at(target)? as i64 - pos as i64) as u32);
                }
            }
            Insn::LookupSwitch { default, pairs } => {
                out.u1(op::LOOKUPSWITCH);
                for _ in 0..switch_pad(pos) {
                    out.u1(0);
                }
                out.u4((at(default)? as i64 - pos as i64) as u32);
                out.u4(pairs.len() as u32);
                for (key, target) in pairs {
                    out.u4(*key as u32);
                    out.u4((at(target)? as i64 - pos as i64) as u32);
                }
            }
        }
    }
    Ok(out.0)
}

fn emit_local(out: &mut Out, lop: u8, slot: u16) {
    let short_base = match lop {
        op::ILOAD..=op::ALOAD => Some(0x1a + (lop - op::ILOAD) * 4),
        op::ISTORE..=op::ASTORE => Some(0x3b + (lop - op::ISTORE) * 4),
        _ => None,
    };
    match short_base {
        Some(base) if slot <= 3 => out.u1(base + slot as u8),
        _ if slot <= u8::MAX as u16 => {
            out.u1(lop);
            out.u1(slot as u8);
        }
        _ => {
            out.u1(op::WIDE);
            out.u1(lop);
            out.u2(slot);
        }
    }
}

/// Serializes the regenerated frames as `full_frame` entries. Compressed
/// frame forms are an encoding-size optimization the verifier does not
/// require, so every entry uses the explicit form.
///
/// A conditional branch rewritten into its wide form makes the fall-through
/// point a target of the inverted test, so that point gets a frame as well.
fn encode_stack_map(
    body: &MethodBody,
    facts: &MethodFacts,
    layout: &Layout,
    frame_classes: &HashMap<String, u16>,
    method: &str,
) -> Result<Vec<u8>, WriterError> {
    let mut by_offset: std::collections::BTreeMap<usize, &crate::frames::Frame> =
        std::collections::BTreeMap::new();
    for &i in &layout.wide_branches {
        let Insn::Branch { op: bop, .. } = &body.code[i] else {
            continue;
        };
        if !op::is_conditional(*bop) {
            continue;
        }
        let frame = facts
            .entry_frames
            .get(i + 1)
            .and_then(Option::as_ref)
            .ok_or(WriterError::UnreachableCode {
                method: method.to_owned(),
                at: i + 1,
            })?;
        by_offset.insert(layout.offsets[i + 1], frame);
    }
    for (idx, frame) in &facts.frames {
        by_offset.insert(layout.offsets[*idx], frame);
    }

    let mut out = Out::default();
    out.u2(len16(by_offset.len(), "stack map frame count")?);
    let mut prev: Option<usize> = None;
    for (offset, frame) in by_offset {
        let delta = match prev {
            None => offset,
            Some(p) => offset - p - 1,
        };
        prev = Some(offset);
        out.u1(255);
        out.u2(len16(delta, "frame offset delta")?);

        let locals = verification_entries(&frame.locals);
        out.u2(len16(locals.len(), "frame local count")?);
        for v in &locals {
            write_vtype(&mut out, v, layout, frame_classes, method)?;
        }
        out.u2(len16(frame.stack.len(), "frame stack count")?);
        for v in &frame.stack {
            write_vtype(&mut out, v, layout, frame_classes, method)?;
        }
    }
    Ok(out.0)
}

/// Collapses slot representation into verification entries: the `Top` shadow
/// after a category-2 value is implicit on disk, and trailing `Top` slots
/// are trimmed.
fn verification_entries(locals: &[VType]) -> Vec<&VType> {
    let mut entries = Vec::with_capacity(locals.len());
    let mut i = 0;
    while i < locals.len() {
        let v = &locals[i];
        entries.push(v);
        i += v.width() as usize;
    }
    while entries.last() == Some(&&VType::Top) {
        entries.pop();
    }
    entries
}

fn write_vtype(
    out: &mut Out,
    v: &VType,
    layout: &Layout,
    frame_classes: &HashMap<String, u16>,
    method: &str,
) -> Result<(), WriterError> {
    match v {
        VType::Top => out.u1(0),
        VType::Int => out.u1(1),
        VType::Float => out.u1(2),
        VType::Double => out.u1(3),
        VType::Long => out.u1(4),
        VType::Null => out.u1(5),
        VType::UninitThis => out.u1(6),
        VType::Object(name) => {
            let idx = frame_classes
                .get(name)
                .copied()
                .ok_or(WriterError::DanglingIndex {
                    index: 0,
                    context: "frame class",
                })?;
            out.u1(7);
            out.u2(idx);
        }
        VType::Uninit(new_idx) => {
            out.u1(8);
            out.u2(len16(layout.offsets[*new_idx], "uninitialized offset")?);
        }
        VType::Retaddr => {
            return Err(WriterError::FrameMerge {
                method: method.to_owned(),
                at: 0,
                msg: "jsr return address cannot appear in a stack map".to_owned(),
            })
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Byte sink
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Out(Vec<u8>);

impl Out {
    fn u1(&mut self, v: u8) {
        self.0.push(v);
    }
    fn u2(&mut self, v: u16) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }
    fn u4(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }
    fn u8v(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }
    fn bytes(&mut self, bytes: &[u8]) {
        self.0.extend_from_slice(bytes);
    }
}

fn write_attr(out: &mut Out, name: Option<u16>, payload: &[u8]) -> Result<(), WriterError> {
    let name = name.ok_or(WriterError::DanglingIndex {
        index: 0,
        context: "attribute name",
    })?;
    out.u2(name);
    out.u4(payload.len() as u32);
    out.bytes(payload);
    Ok(())
}

fn write_attr_u2(out: &mut Out, name: Option<u16>, value: u16) -> Result<(), WriterError> {
    write_attr(out, name, &value.to_be_bytes())
}

fn len16(value: usize, context: &'static str) -> Result<u16, WriterError> {
    u16::try_from(value).map_err(|_| WriterError::OffsetOverflow { context, value })
}

/// Encodes a string as JVM modified UTF-8: NUL becomes the two-byte form and
/// supplementary characters become CESU-8 surrogate pairs.
pub(crate) fn encode_mutf8(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    for c in s.chars() {
        let cp = c as u32;
        match cp {
            0 => out.extend_from_slice(&[0xc0, 0x80]),
            0x01..=0x7f => out.push(cp as u8),
            0x80..=0x7ff => {
                out.push(0xc0 | (cp >> 6) as u8);
                out.push(0x80 | (cp & 0x3f) as u8);
            }
            0x800..=0xffff => {
                out.push(0xe0 | (cp >> 12) as u8);
                out.push(0x80 | ((cp >> 6) & 0x3f) as u8);
                out.push(0x80 | (cp & 0x3f) as u8);
            }
            _ => {
                let v = cp - 0x10000;
                let hi = 0xd800 + (v >> 10);
                let lo = 0xdc00 + (v & 0x3ff);
                for unit in [hi, lo] {
                    out.push(0xe0 | (unit >> 12) as u8);
                    out.push(0x80 | ((unit >> 6) & 0x3f) as u8);
                    out.push(0x80 | (unit & 0x3f) as u8);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder;

    #[test]
    fn mutf8_round_trips_through_decoder() {
        for s in ["", "plain", "nul\0inside", "caf\u{e9}", "\u{1f600}"] {
            let bytes = encode_mutf8(s);
            assert_eq!(decoder::decode_mutf8(&bytes).as_deref(), Some(s));
        }
    }

    #[test]
    fn mutf8_never_emits_raw_nul() {
        assert!(!encode_mutf8("a\0b").contains(&0));
    }

    #[test]
    fn switch_padding_aligns_operands() {
        for pos in 0..8 {
            assert_eq!((pos + 1 + switch_pad(pos)) % 4, 0);
        }
    }

    #[test]
    fn short_local_forms() {
        let mut out = Out::default();
        emit_local(&mut out, op::ALOAD, 0);
        emit_local(&mut out, op::ISTORE, 2);
        emit_local(&mut out, op::ILOAD, 200);
        emit_local(&mut out, op::LSTORE, 300);
        assert_eq!(
            out.0,
            vec![
                0x2a, // aload_0
                0x3d, // istore_2
                op::ILOAD,
                200,
                op::WIDE,
                op::LSTORE,
                0x01,
                0x2c,
            ]
        );
    }
}
