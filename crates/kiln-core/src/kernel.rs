//! Structured kernel bodies.
//!
//! Operations describe their per-element computation as a list of [`Stmt`]s
//! instead of raw text. Source text is rendered from the body (see
//! [`crate::gpu::wgsl`]), so renaming for fusion touches the body and the text
//! follows from it.

use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryFn {
    Abs,
    Cos,
    Exp,
    HardSwish,
    Log,
    Neg,
    Rsqrt,
    Sigmoid,
    Sin,
    Sqrt,
    Square,
    Tanh,
}

impl UnaryFn {
    pub fn name(&self) -> &'static str {
        match self {
            UnaryFn::Abs => "abs",
            UnaryFn::Cos => "cos",
            UnaryFn::Exp => "exp",
            UnaryFn::HardSwish => "hard_swish",
            UnaryFn::Log => "log",
            UnaryFn::Neg => "neg",
            UnaryFn::Rsqrt => "rsqrt",
            UnaryFn::Sigmoid => "sigmoid",
            UnaryFn::Sin => "sin",
            UnaryFn::Sqrt => "sqrt",
            UnaryFn::Square => "square",
            UnaryFn::Tanh => "tanh",
        }
    }

    pub fn apply(&self, x: f32) -> f32 {
        match self {
            UnaryFn::Abs => x.abs(),
            UnaryFn::Cos => x.cos(),
            UnaryFn::Exp => x.exp(),
            UnaryFn::HardSwish => x * (x + 3.).clamp(0., 6.) / 6.,
            UnaryFn::Log => x.ln(),
            UnaryFn::Neg => -x,
            UnaryFn::Rsqrt => 1. / x.sqrt(),
            UnaryFn::Sigmoid => 1. / (1. + (-x).exp()),
            UnaryFn::Sin => x.sin(),
            UnaryFn::Sqrt => x.sqrt(),
            UnaryFn::Square => x * x,
            UnaryFn::Tanh => x.tanh(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryFn {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    Pow,
}

impl BinaryFn {
    pub fn apply(&self, a: f32, b: f32) -> f32 {
        match self {
            BinaryFn::Add => a + b,
            BinaryFn::Sub => a - b,
            BinaryFn::Mul => a * b,
            BinaryFn::Div => a / b,
            BinaryFn::Min => a.min(b),
            BinaryFn::Max => a.max(b),
            BinaryFn::Pow => a.powf(b),
        }
    }
}

/// What a name in a kernel body refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NameKind {
    /// A local value defined by a `Let` or `Var`.
    Local,
    /// A scalar argument.
    Scalar,
    /// A buffer argument, indexed by the current channel.
    Buffer,
    /// A tensor argument read at the current coordinate.
    TensorRead,
    /// A tensor argument written at the current coordinate.
    TensorWrite,
}

impl NameKind {
    /// Argument kind a reference of this kind must resolve to.
    pub fn argument_kind(&self) -> Option<&'static str> {
        match self {
            NameKind::Local => None,
            NameKind::Scalar => Some("scalar"),
            NameKind::Buffer => Some("buffer"),
            NameKind::TensorRead | NameKind::TensorWrite => Some("tensor"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(f32),
    Value(String),
    Scalar(String),
    Channel(String),
    /// Reads the tensor argument at the current coordinate. With
    /// `guard_channels`, slices past the tensor's own channel count read zero.
    Read {
        tensor: String,
        guard_channels: bool,
    },
    Unary(UnaryFn, Box<Expr>),
    Binary(BinaryFn, Box<Expr>, Box<Expr>),
    Clamp(Box<Expr>, Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn value(name: impl Into<String>) -> Self {
        Expr::Value(name.into())
    }

    pub fn scalar(name: impl Into<String>) -> Self {
        Expr::Scalar(name.into())
    }

    pub fn channel(name: impl Into<String>) -> Self {
        Expr::Channel(name.into())
    }

    pub fn read(tensor: impl Into<String>) -> Self {
        Expr::Read {
            tensor: tensor.into(),
            guard_channels: false,
        }
    }

    pub fn read_guarded(tensor: impl Into<String>) -> Self {
        Expr::Read {
            tensor: tensor.into(),
            guard_channels: true,
        }
    }

    pub fn unary(op: UnaryFn, x: Expr) -> Self {
        Expr::Unary(op, Box::new(x))
    }

    pub fn binary(op: BinaryFn, a: Expr, b: Expr) -> Self {
        Expr::Binary(op, Box::new(a), Box::new(b))
    }

    pub fn clamp(x: Expr, lo: Expr, hi: Expr) -> Self {
        Expr::Clamp(Box::new(x), Box::new(lo), Box::new(hi))
    }

    fn for_each_name(&self, f: &mut dyn FnMut(&str, NameKind)) {
        match self {
            Expr::Literal(_) => {}
            Expr::Value(n) => f(n, NameKind::Local),
            Expr::Scalar(n) => f(n, NameKind::Scalar),
            Expr::Channel(n) => f(n, NameKind::Buffer),
            Expr::Read { tensor, .. } => f(tensor, NameKind::TensorRead),
            Expr::Unary(_, x) => x.for_each_name(f),
            Expr::Binary(_, a, b) => {
                a.for_each_name(f);
                b.for_each_name(f);
            }
            Expr::Clamp(x, lo, hi) => {
                x.for_each_name(f);
                lo.for_each_name(f);
                hi.for_each_name(f);
            }
        }
    }

    fn for_each_read(&self, f: &mut dyn FnMut(&str, bool)) {
        match self {
            Expr::Read {
                tensor,
                guard_channels,
            } => f(tensor, *guard_channels),
            Expr::Unary(_, x) => x.for_each_read(f),
            Expr::Binary(_, a, b) => {
                a.for_each_read(f);
                b.for_each_read(f);
            }
            Expr::Clamp(x, lo, hi) => {
                x.for_each_read(f);
                lo.for_each_read(f);
                hi.for_each_read(f);
            }
            _ => {}
        }
    }

    fn map_names(&mut self, f: &mut dyn FnMut(&mut String, NameKind)) {
        match self {
            Expr::Literal(_) => {}
            Expr::Value(n) => f(n, NameKind::Local),
            Expr::Scalar(n) => f(n, NameKind::Scalar),
            Expr::Channel(n) => f(n, NameKind::Buffer),
            Expr::Read { tensor, .. } => f(tensor, NameKind::TensorRead),
            Expr::Unary(_, x) => x.map_names(f),
            Expr::Binary(_, a, b) => {
                a.map_names(f);
                b.map_names(f);
            }
            Expr::Clamp(x, lo, hi) => {
                x.map_names(f);
                lo.map_names(f);
                hi.map_names(f);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// Immutable local.
    Let(String, Expr),
    /// Mutable local.
    Var(String, Expr),
    Assign(String, Expr),
    Store(String, Expr),
    /// Where the code of linked operations is spliced in.
    LinkPoint,
}

impl Stmt {
    fn map_names(&mut self, f: &mut dyn FnMut(&mut String, NameKind)) {
        match self {
            Stmt::Let(n, e) | Stmt::Var(n, e) | Stmt::Assign(n, e) => {
                f(n, NameKind::Local);
                e.map_names(f);
            }
            Stmt::Store(n, e) => {
                f(n, NameKind::TensorWrite);
                e.map_names(f);
            }
            Stmt::LinkPoint => {}
        }
    }
}

/// The per-element computation of a kernel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KernelBody {
    stmts: Vec<Stmt>,
}

impl KernelBody {
    pub fn new(stmts: Vec<Stmt>) -> Self {
        Self { stmts }
    }

    pub fn stmts(&self) -> &[Stmt] {
        &self.stmts
    }

    pub fn push(&mut self, stmt: Stmt) {
        self.stmts.push(stmt);
    }

    pub fn extend(&mut self, stmts: impl IntoIterator<Item = Stmt>) {
        self.stmts.extend(stmts);
    }

    pub fn into_stmts(self) -> Vec<Stmt> {
        self.stmts
    }

    pub fn has_link_point(&self) -> bool {
        self.stmts.iter().any(|s| matches!(s, Stmt::LinkPoint))
    }

    /// Replaces the link point with `stmts`. Returns false if there is none.
    pub fn splice_link_point(&mut self, stmts: Vec<Stmt>) -> bool {
        let Some(idx) = self.stmts.iter().position(|s| matches!(s, Stmt::LinkPoint)) else {
            return false;
        };
        self.stmts.splice(idx..=idx, stmts);
        true
    }

    /// Drops the link point, for bodies compiled without linked operations.
    pub fn strip_link_point(&mut self) {
        self.stmts.retain(|s| !matches!(s, Stmt::LinkPoint));
    }

    /// Appends `postfix` to every name in the body, locals and argument
    /// references alike.
    pub fn add_postfix(&mut self, postfix: &str) {
        self.map_names(&mut |name, _| name.push_str(postfix));
    }

    /// Renames the local `from` to `to` wherever it is used.
    pub fn rename_local(&mut self, from: &str, to: &str) {
        self.map_names(&mut |name, kind| {
            if kind == NameKind::Local && name == from {
                *name = to.to_string();
            }
        });
    }

    pub fn map_names(&mut self, f: &mut dyn FnMut(&mut String, NameKind)) {
        for stmt in self.stmts.iter_mut() {
            stmt.map_names(f);
        }
    }

    /// Every argument the body refers to, in first-use order.
    pub fn argument_refs(&self) -> Vec<(String, NameKind)> {
        let mut refs: Vec<(String, NameKind)> = vec![];
        let mut record = |name: &str, kind: NameKind| {
            if kind != NameKind::Local && !refs.iter().any(|(n, k)| n == name && *k == kind) {
                refs.push((name.to_string(), kind));
            }
        };
        for stmt in self.stmts.iter() {
            match stmt {
                Stmt::Let(_, e) | Stmt::Var(_, e) | Stmt::Assign(_, e) => {
                    e.for_each_name(&mut record)
                }
                Stmt::Store(n, e) => {
                    e.for_each_name(&mut record);
                    record(n, NameKind::TensorWrite);
                }
                Stmt::LinkPoint => {}
            }
        }
        refs
    }

    /// Tensors the body reads, in first-use order, each with whether every
    /// read of it is channel-guarded.
    pub fn tensor_reads(&self) -> Vec<(String, bool)> {
        let mut reads: Vec<(String, bool)> = vec![];
        let mut record = |name: &str, guarded: bool| {
            match reads.iter_mut().find(|(n, _)| n == name) {
                Some((_, all_guarded)) => *all_guarded &= guarded,
                None => reads.push((name.to_string(), guarded)),
            }
        };
        for stmt in self.stmts.iter() {
            match stmt {
                Stmt::Let(_, e) | Stmt::Var(_, e) | Stmt::Assign(_, e) | Stmt::Store(_, e) => {
                    e.for_each_read(&mut record)
                }
                Stmt::LinkPoint => {}
            }
        }
        reads
    }

    /// Names of all locals the body defines.
    pub fn locals(&self) -> Vec<&str> {
        self.stmts
            .iter()
            .filter_map(|s| match s {
                Stmt::Let(n, _) | Stmt::Var(n, _) => Some(n.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Checks that locals are defined once, before use, and that only `Var`s
    /// are assigned to.
    pub fn check_locals(&self) -> Result<(), String> {
        let mut defined: Vec<(&str, bool)> = vec![];
        for stmt in self.stmts.iter() {
            let mut undefined = None;
            let mut check = |name: &str, kind: NameKind| {
                if kind == NameKind::Local
                    && undefined.is_none()
                    && !defined.iter().any(|(n, _)| *n == name)
                {
                    undefined = Some(name.to_string());
                }
            };
            match stmt {
                Stmt::Let(_, e) | Stmt::Var(_, e) | Stmt::Assign(_, e) | Stmt::Store(_, e) => {
                    e.for_each_name(&mut check)
                }
                Stmt::LinkPoint => {}
            }
            if let Some(name) = undefined {
                return Err(format!("`{name}` is used before it is defined"));
            }
            match stmt {
                Stmt::Let(n, _) | Stmt::Var(n, _) => {
                    if defined.iter().any(|(d, _)| *d == n.as_str()) {
                        return Err(format!("`{n}` is defined twice"));
                    }
                    defined.push((n.as_str(), matches!(stmt, Stmt::Var(..))));
                }
                Stmt::Assign(n, _) => match defined.iter().find(|(d, _)| *d == n.as_str()) {
                    Some((_, true)) => {}
                    Some((_, false)) => return Err(format!("`{n}` is immutable")),
                    None => return Err(format!("`{n}` is assigned before it is defined")),
                },
                _ => {}
            }
        }
        Ok(())
    }
}

impl Display for KernelBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", crate::gpu::wgsl::render_stmts(&self.stmts, None))
    }
}
