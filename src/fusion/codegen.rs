//! WGSL code generation for kernel signatures
//!
//! WGSL has no templates, so every kernel is generated as text from its
//! signature, the same way for every dtype:
//!
//! - all buffers are `read_write` storage bindings in parameter order, so a
//!   target vector may also appear as an operand of its own expression
//! - scalars and the element count travel in one trailing `params: array<u32>`
//!   binding (`params[0]` is the element count, scalars follow as raw bits)
//! - element-wise kernels use a grid-stride loop, so a dispatch capped at
//!   `MAX_DISPATCH_WORKGROUPS` still covers every element

use std::fmt::Write as _;

use super::ops::{BinaryOp, ReduceOp, UnaryOp};
use super::shape::{ExprShape, Signature};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::runtime::{KernelSource, ParamKind};

/// WGSL type name for a given DType
pub fn wgsl_type(dtype: DType) -> Option<&'static str> {
    match dtype {
        DType::F32 => Some("f32"),
        DType::I32 => Some("i32"),
        DType::U32 => Some("u32"),
        DType::F64 => None,
    }
}

fn literal(dtype: DType, value: Literal) -> &'static str {
    match (dtype, value) {
        (DType::I32, Literal::Zero) => "0i",
        (DType::U32, Literal::Zero) => "0u",
        (_, Literal::Zero) => "0.0",
        (DType::I32, Literal::One) => "1i",
        (DType::U32, Literal::One) => "1u",
        (_, Literal::One) => "1.0",
        (DType::I32, Literal::Max) => "2147483647i",
        (DType::U32, Literal::Max) => "4294967295u",
        (_, Literal::Max) => "3.40282347e+38",
        (DType::I32, Literal::Min) => "(-2147483647i - 1i)",
        (DType::U32, Literal::Min) => "0u",
        (_, Literal::Min) => "-3.40282347e+38",
    }
}

#[derive(Clone, Copy)]
enum Literal {
    Zero,
    One,
    Min,
    Max,
}

fn identity(dtype: DType, op: ReduceOp) -> &'static str {
    match op {
        ReduceOp::Sum => literal(dtype, Literal::Zero),
        ReduceOp::Prod => literal(dtype, Literal::One),
        ReduceOp::Min => literal(dtype, Literal::Max),
        ReduceOp::Max => literal(dtype, Literal::Min),
    }
}

fn combine(op: ReduceOp, a: &str, b: &str) -> String {
    match op {
        ReduceOp::Sum => format!("({a} + {b})"),
        ReduceOp::Prod => format!("({a} * {b})"),
        ReduceOp::Min => format!("min({a}, {b})"),
        ReduceOp::Max => format!("max({a}, {b})"),
    }
}

fn unary_fn(op: UnaryOp) -> &'static str {
    match op {
        UnaryOp::Neg => "-",
        UnaryOp::Abs => "abs",
        UnaryOp::Sqrt => "sqrt",
        UnaryOp::Exp => "exp",
        UnaryOp::Log => "log",
        UnaryOp::Sin => "sin",
        UnaryOp::Cos => "cos",
        UnaryOp::Tan => "tan",
        UnaryOp::Tanh => "tanh",
        UnaryOp::Floor => "floor",
        UnaryOp::Ceil => "ceil",
    }
}

fn apply_binary(op: BinaryOp, a: &str, b: &str) -> String {
    match op.symbol() {
        Some(sym) => format!("({a} {sym} {b})"),
        None => format!("{}({a}, {b})", op.name()),
    }
}

/// Emit the expression for `shape`, numbering leaves from `*next`
fn emit_expr(shape: &ExprShape, next: &mut usize, index: &str) -> String {
    match shape {
        ExprShape::Vector => {
            let k = *next;
            *next += 1;
            format!("v{k}[{index}]")
        }
        ExprShape::Scalar => {
            let k = *next;
            *next += 1;
            format!("s{k}")
        }
        ExprShape::Unary(op, child) => {
            let inner = emit_expr(child, next, index);
            format!("{}({inner})", unary_fn(*op))
        }
        ExprShape::Binary(op, lhs, rhs) => {
            let a = emit_expr(lhs, next, index);
            let b = emit_expr(rhs, next, index);
            apply_binary(*op, &a, &b)
        }
    }
}

/// Storage bindings for every buffer parameter followed by `params`
fn emit_bindings(out: &mut String, source: &KernelSource, t: &str) -> Result<()> {
    let mut binding = 0u32;
    for param in &source.params {
        if let ParamKind::Buffer { dtype, .. } = param.kind {
            let ty = if dtype == source.signature.dtype() {
                t
            } else {
                wgsl_type(dtype).ok_or_else(|| unsupported(source, dtype))?
            };
            let _ = writeln!(
                out,
                "@group(0) @binding({binding}) var<storage, read_write> {}: array<{ty}>;",
                param.name
            );
            binding += 1;
        }
    }
    let _ = writeln!(
        out,
        "@group(0) @binding({binding}) var<storage, read_write> params: array<u32>;\n"
    );
    Ok(())
}

/// `let` bindings decoding scalar parameters from `params[1..]`
fn emit_scalars(out: &mut String, source: &KernelSource, t: &str) {
    let scalars = source
        .params
        .iter()
        .filter(|p| matches!(p.kind, ParamKind::Scalar(_)));
    for (k, param) in scalars.enumerate() {
        let slot = k + 1;
        let decoded = if t == "u32" {
            format!("params[{slot}]")
        } else {
            format!("bitcast<{t}>(params[{slot}])")
        };
        let _ = writeln!(out, "    let {} = {decoded};", param.name);
    }
}

fn unsupported(source: &KernelSource, dtype: DType) -> Error {
    Error::KernelCompile {
        kernel: source.name.clone(),
        diagnostics: format!("{dtype} is not available in WGSL"),
    }
}

/// Generate the WGSL text of a kernel
///
/// Fails with `KernelCompile` for element types WGSL cannot express (`f64`).
pub fn wgsl(source: &KernelSource) -> Result<String> {
    let dtype = source.signature.dtype();
    let t = wgsl_type(dtype).ok_or_else(|| unsupported(source, dtype))?;
    let wg = source.workgroup_size;
    let name = &source.name;

    let mut out = String::new();
    let _ = writeln!(out, "// vexr generated kernel: {}\n", source.signature);
    emit_bindings(&mut out, source, t)?;

    match &source.signature {
        Signature::Elementwise { assign, shape, .. } => {
            let value = emit_expr(shape, &mut 0, "i");
            let store = match assign.binary() {
                Some(op) => apply_binary(op, "dst[i]", &value),
                None => value,
            };
            let _ = writeln!(
                out,
                "@compute @workgroup_size({wg})
fn {name}(@builtin(global_invocation_id) gid: vec3<u32>,
          @builtin(num_workgroups) nwg: vec3<u32>) {{
    let n = params[0];"
            );
            emit_scalars(&mut out, source, t);
            let _ = writeln!(
                out,
                "    let stride = nwg.x * {wg}u;
    for (var i: u32 = gid.x; i < n; i = i + stride) {{
        dst[i] = {store};
    }}
}}"
            );
        }
        Signature::Reduce {
            op, shape, groups, ..
        } => {
            let value = emit_expr(shape, &mut 0, "i");
            let step = combine(*op, "acc", &value);
            let tree = combine(*op, "scratch[tid]", "scratch[tid + s]");
            let _ = writeln!(
                out,
                "var<workgroup> scratch: array<{t}, {wg}>;

@compute @workgroup_size({wg})
fn {name}(@builtin(local_invocation_id) lid: vec3<u32>,
          @builtin(workgroup_id) wid: vec3<u32>) {{
    let n = params[0];"
            );
            emit_scalars(&mut out, source, t);
            let _ = writeln!(
                out,
                "    let tid = lid.x;
    let per_group = (n + {groups}u - 1u) / {groups}u;
    let start = min(wid.x * per_group, n);
    let end = min(start + per_group, n);

    var acc: {t} = {id};
    for (var i: u32 = start + tid; i < end; i = i + {wg}u) {{
        acc = {step};
    }}
    scratch[tid] = acc;
    workgroupBarrier();

    for (var s: u32 = {half}u; s > 0u; s = s >> 1u) {{
        if (tid < s) {{
            scratch[tid] = {tree};
        }}
        workgroupBarrier();
    }}

    if (tid == 0u) {{
        partials[wid.x] = scratch[0];
    }}
}}",
                id = identity(dtype, *op),
                half = wg / 2,
            );
        }
        Signature::CsrProduct { accumulate, .. } => {
            let store = if *accumulate {
                "y[row] + alpha * sum"
            } else {
                "alpha * sum"
            };
            let _ = writeln!(
                out,
                "@compute @workgroup_size({wg})
fn {name}(@builtin(global_invocation_id) gid: vec3<u32>,
          @builtin(num_workgroups) nwg: vec3<u32>) {{
    let n = params[0];"
            );
            emit_scalars(&mut out, source, t);
            let _ = writeln!(
                out,
                "    let stride = nwg.x * {wg}u;
    for (var row: u32 = gid.x; row < n; row = row + stride) {{
        var sum: {t} = {zero};
        let row_end = row_ptr[row + 1u];
        for (var j: u32 = row_ptr[row]; j < row_end; j = j + 1u) {{
            sum = sum + val[j] * x[col[j]];
        }}
        y[row] = {store};
    }}
}}",
                zero = literal(dtype, Literal::Zero),
            );
        }
        Signature::Gather { .. } => {
            let _ = writeln!(
                out,
                "@compute @workgroup_size({wg})
fn {name}(@builtin(global_invocation_id) gid: vec3<u32>,
          @builtin(num_workgroups) nwg: vec3<u32>) {{
    let n = params[0];
    let stride = nwg.x * {wg}u;
    for (var k: u32 = gid.x; k < n; k = k + stride) {{
        dst[k] = src[idx[k]];
    }}
}}"
            );
        }
    }

    Ok(out)
}

/// Number of workgroups to dispatch for `n` work items
pub fn dispatch_size(source: &KernelSource, n: usize) -> u32 {
    match source.signature {
        Signature::Reduce { groups, .. } => groups,
        _ => {
            let wg = source.workgroup_size.max(1) as usize;
            n.div_ceil(wg)
                .clamp(1, crate::config::MAX_DISPATCH_WORKGROUPS as usize) as u32
        }
    }
}
