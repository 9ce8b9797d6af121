//! WGSL source emission.
//!
//! Kernels are laid out on a (width * batch, height, slices) grid, one thread
//! per four-channel slice of one output pixel. Work-group dimensions are
//! pipeline-overridable constants, so picking a new work-group never changes
//! the source text.

mod dtype;

pub use dtype::*;

use crate::{AccessType, Argument, Arguments, BinaryFn, DType, Expr, KernelBody, Precision, Stmt};
use crate::{StorageType, TensorDescriptor, UnaryFn};
use std::fmt::Write;

/// Growable buffer of WGSL text.
#[derive(Debug, Default)]
pub struct WgslFragment(pub String);

impl WgslFragment {
    pub fn new(capacity: usize) -> Self {
        Self(String::with_capacity(capacity))
    }

    pub fn write(&mut self, s: impl AsRef<str>) {
        self.0.push_str(s.as_ref());
    }
}

impl std::fmt::Display for WgslFragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn needs_f16(args: &Arguments, precision: Precision) -> bool {
    precision.compute_dtype() == DType::F16
        || precision.storage_dtype() == DType::F16
        || args.iter().any(|(_, a)| match a {
            Argument::Half(_) => true,
            Argument::Buffer(b) => b.dtype == DType::F16,
            Argument::Tensor(t) => t.descriptor.dtype == DType::F16,
            _ => false,
        })
}

fn texture_format(dtype: DType) -> &'static str {
    match dtype {
        DType::F32 => "rgba32float",
        DType::F16 => "rgba16float",
    }
}

fn texture_binding(desc: &TensorDescriptor, access: AccessType) -> String {
    let (sampled, storage) = match desc.storage_type {
        StorageType::TextureArray => ("texture_2d_array", "texture_storage_2d_array"),
        StorageType::Texture3D => ("texture_3d", "texture_storage_3d"),
        _ => ("texture_2d", "texture_storage_2d"),
    };
    match access {
        AccessType::Read => format!("{sampled}<f32>"),
        AccessType::Write => format!("{storage}<{}, write>", texture_format(desc.dtype)),
    }
}

/// Texel or element coordinate of the current thread in `name`.
fn coords(name: &str, storage_type: StorageType) -> String {
    match storage_type {
        StorageType::Buffer | StorageType::ImageBuffer => format!(
            "((S * args.{name}_height + Y) * args.{name}_width + X) * args.{name}_batch + B"
        ),
        StorageType::Texture2D => format!(
            "vec2<i32>(i32(X * args.{name}_batch + B), i32(Y * args.{name}_slices + S))"
        ),
        StorageType::TextureArray => {
            format!("vec2<i32>(i32(X * args.{name}_batch + B), i32(Y)), i32(S)")
        }
        StorageType::Texture3D => {
            format!("vec3<i32>(i32(X * args.{name}_batch + B), i32(Y), i32(S))")
        }
        StorageType::SingleTexture2D => "vec2<i32>(i32(X), i32(Y))".to_string(),
    }
}

fn read_tensor(name: &str, storage_type: StorageType, guard_channels: bool) -> String {
    let load = match storage_type {
        StorageType::Buffer | StorageType::ImageBuffer => {
            format!("FLT4({name}[{}])", coords(name, storage_type))
        }
        _ => format!("FLT4(textureLoad({name}, {}, 0))", coords(name, storage_type)),
    };
    if guard_channels {
        format!("select(FLT4(0), {load}, S < args.{name}_slices)")
    } else {
        load
    }
}

fn write_tensor(name: &str, desc: &TensorDescriptor, value: &str) -> String {
    match desc.storage_type {
        StorageType::Buffer | StorageType::ImageBuffer => format!(
            "{name}[{}] = vec4<{}>({value});",
            coords(name, desc.storage_type),
            type_name(desc.dtype)
        ),
        st => format!(
            "textureStore({name}, {}, vec4<f32>({value}));",
            coords(name, st)
        ),
    }
}

struct Renderer<'a> {
    args: Option<&'a Arguments>,
    literal_dtype: DType,
}

impl Renderer<'_> {
    fn storage_type(&self, name: &str) -> StorageType {
        match self.args.and_then(|a| a.get(name)) {
            Some(Argument::Tensor(t)) => t.descriptor.storage_type,
            _ => StorageType::Buffer,
        }
    }

    fn descriptor(&self, name: &str) -> TensorDescriptor {
        match self.args.and_then(|a| a.get(name)) {
            Some(Argument::Tensor(t)) => t.descriptor,
            _ => TensorDescriptor::default(),
        }
    }

    fn lit(&self, v: f32) -> String {
        format!("FLT4({})", render_literal(self.literal_dtype, v))
    }

    fn expr(&self, e: &Expr) -> String {
        match e {
            Expr::Literal(v) => self.lit(*v),
            Expr::Value(n) => n.clone(),
            Expr::Scalar(n) => format!("FLT4(FLT(args.{n}))"),
            Expr::Channel(n) => format!("FLT4({n}[S])"),
            Expr::Read {
                tensor,
                guard_channels,
            } => read_tensor(tensor, self.storage_type(tensor), *guard_channels),
            Expr::Unary(op, x) => {
                let x = self.expr(x);
                match op {
                    UnaryFn::Neg => format!("(-{x})"),
                    UnaryFn::Rsqrt => format!("inverseSqrt({x})"),
                    UnaryFn::Square => format!("({x} * {x})"),
                    UnaryFn::Sigmoid => format!(
                        "({one} / ({one} + exp(-{x})))",
                        one = self.lit(1.)
                    ),
                    UnaryFn::HardSwish => format!(
                        "({x} * clamp({x} + {three}, {zero}, {six}) / {six})",
                        three = self.lit(3.),
                        zero = self.lit(0.),
                        six = self.lit(6.)
                    ),
                    f => format!("{}({x})", f.name()),
                }
            }
            Expr::Binary(op, a, b) => {
                let (a, b) = (self.expr(a), self.expr(b));
                match op {
                    BinaryFn::Add => format!("({a} + {b})"),
                    BinaryFn::Sub => format!("({a} - {b})"),
                    BinaryFn::Mul => format!("({a} * {b})"),
                    BinaryFn::Div => format!("({a} / {b})"),
                    BinaryFn::Min => format!("min({a}, {b})"),
                    BinaryFn::Max => format!("max({a}, {b})"),
                    BinaryFn::Pow => format!("pow({a}, {b})"),
                }
            }
            Expr::Clamp(x, lo, hi) => format!(
                "clamp({}, {}, {})",
                self.expr(x),
                self.expr(lo),
                self.expr(hi)
            ),
        }
    }

    fn stmts(&self, stmts: &[Stmt], indent: usize, out: &mut String) {
        let pad = " ".repeat(indent);
        for stmt in stmts {
            let line = match stmt {
                Stmt::Let(n, e) => format!("let {n} = {};", self.expr(e)),
                Stmt::Var(n, e) => format!("var {n} = {};", self.expr(e)),
                Stmt::Assign(n, e) => format!("{n} = {};", self.expr(e)),
                Stmt::Store(n, e) => write_tensor(n, &self.descriptor(n), &self.expr(e)),
                Stmt::LinkPoint => "// linked operations".to_string(),
            };
            let _ = writeln!(out, "{pad}{line}");
        }
    }
}

/// Renders kernel statements. Without `args`, tensors are assumed to be
/// buffers.
pub fn render_stmts(stmts: &[Stmt], args: Option<&Arguments>) -> String {
    let mut out = String::new();
    Renderer {
        args,
        literal_dtype: DType::F32,
    }
    .stmts(stmts, 0, &mut out);
    out
}

/// Renders a complete compute shader for `body`.
///
/// `grid_tensor` names the tensor whose extent bounds the launch; threads
/// outside of it return immediately.
pub fn render_kernel(
    name: &str,
    args: &Arguments,
    body: &KernelBody,
    precision: Precision,
    grid_tensor: &str,
) -> String {
    let compute = precision.compute_dtype();
    let mut fragment = WgslFragment::new(2048);

    fragment.write(format!("// {name}\n"));
    if needs_f16(args, precision) {
        fragment.write("enable f16;\n\n");
    }
    fragment.write(format!("alias FLT = {};\n", type_name(compute)));
    fragment.write("alias FLT4 = vec4<FLT>;\n\n");
    for (dim, size) in ["x", "y", "z"].iter().zip(crate::DEFAULT_WORK_GROUP.to_array()) {
        fragment.write(format!("override wg_{dim}: u32 = {size}u;\n"));
    }
    fragment.write("\n");

    fragment.write("struct Args {\n");
    for (arg_name, argument) in args.iter() {
        match argument {
            Argument::Int(_) => fragment.write(format!("    {arg_name}: i32,\n")),
            Argument::Float(_) => fragment.write(format!("    {arg_name}: f32,\n")),
            Argument::Half(_) => fragment.write(format!("    {arg_name}: f16,\n")),
            Argument::Tensor(_) => {
                for dim in ["width", "height", "slices", "batch"] {
                    fragment.write(format!("    {arg_name}_{dim}: u32,\n"));
                }
            }
            Argument::Buffer(_) => {}
        }
    }
    fragment.write("}\n\n");
    fragment.write("@group(0) @binding(0) var<uniform> args: Args;\n");

    let mut binding = 1;
    for (arg_name, argument) in args.iter() {
        let decl = match argument {
            Argument::Buffer(b) => format!(
                "var<storage, read> {arg_name}: array<vec4<{}>>",
                type_name(b.dtype)
            ),
            Argument::Tensor(t) if t.descriptor.storage_type.is_texture() => {
                format!("var {arg_name}: {}", texture_binding(&t.descriptor, t.access))
            }
            Argument::Tensor(t) => {
                let access = match t.access {
                    AccessType::Read => "read",
                    AccessType::Write => "read_write",
                };
                format!(
                    "var<storage, {access}> {arg_name}: array<vec4<{}>>",
                    type_name(t.descriptor.dtype)
                )
            }
            _ => continue,
        };
        fragment.write(format!("@group(0) @binding({binding}) {decl};\n"));
        binding += 1;
    }

    fragment.write("\n@compute @workgroup_size(wg_x, wg_y, wg_z)\n");
    fragment.write("fn main(@builtin(global_invocation_id) gid: vec3<u32>) {\n");
    fragment.write(format!("    let B = gid.x % args.{grid_tensor}_batch;\n"));
    fragment.write(format!("    let X = gid.x / args.{grid_tensor}_batch;\n"));
    fragment.write("    let Y = gid.y;\n    let S = gid.z;\n");
    fragment.write(format!(
        "    if (X >= args.{g}_width || Y >= args.{g}_height || S >= args.{g}_slices) {{\n        return;\n    }}\n",
        g = grid_tensor
    ));

    let mut stmts = String::new();
    Renderer {
        args: Some(args),
        literal_dtype: compute,
    }
    .stmts(body.stmts(), 4, &mut stmts);
    fragment.write(stmts);
    fragment.write("}\n");
    fragment.0
}
