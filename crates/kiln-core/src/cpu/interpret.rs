use super::CpuKernel;
use crate::{BoundValue, DType, Dispatch, Expr, QueueError, Stmt, Tensor, TensorHandle, TensorPool};
use glam::UVec3;

#[derive(Clone, Copy)]
struct Coord {
    b: usize,
    y: usize,
    x: usize,
    c: usize,
}

struct Interpreter<'a> {
    dispatch: &'a Dispatch<'a>,
    tensors: &'a TensorPool,
    compute: DType,
    outputs: Vec<(String, TensorHandle, Tensor)>,
}

fn submit_error(msg: impl Into<String>) -> QueueError {
    QueueError::Submit(msg.into())
}

impl Interpreter<'_> {
    fn tensor(&self, name: &str) -> Result<&Tensor, QueueError> {
        match self.dispatch.args.get(name) {
            Some(BoundValue::Tensor(handle, _)) => Ok(self.tensors.get(*handle)?),
            _ => Err(submit_error(format!("`{name}` is not a bound tensor"))),
        }
    }

    fn eval(&self, expr: &Expr, locals: &[(String, f32)], at: Coord) -> Result<f32, QueueError> {
        let v = match expr {
            Expr::Literal(v) => *v,
            Expr::Value(n) => locals
                .iter()
                .rev()
                .find(|(l, _)| l == n)
                .map(|(_, v)| *v)
                .ok_or_else(|| submit_error(format!("`{n}` is not defined")))?,
            Expr::Scalar(n) => match self.dispatch.args.get(n) {
                Some(BoundValue::Float(v)) => *v,
                Some(BoundValue::Int(v)) => *v as f32,
                _ => return Err(submit_error(format!("`{n}` is not a bound scalar"))),
            },
            Expr::Channel(n) => match self.dispatch.args.get(n) {
                Some(BoundValue::Buffer(data)) => data.get(at.c).copied().unwrap_or(0.),
                _ => return Err(submit_error(format!("`{n}` is not a bound buffer"))),
            },
            Expr::Read {
                tensor,
                guard_channels,
            } => {
                let t = self.tensor(tensor)?;
                let s = t.shape();
                if at.b >= s.batch() || at.y >= s.height() || at.x >= s.width() {
                    return Err(submit_error(format!(
                        "read of `{tensor}` at ({}, {}, {}) is outside {s:?}",
                        at.b, at.y, at.x
                    )));
                }
                // Lanes of the last slice past the channel count are padding.
                if at.c / 4 >= s.slices() && !guard_channels {
                    return Err(submit_error(format!(
                        "unguarded read of `{tensor}` at channel {} is outside {s:?}",
                        at.c
                    )));
                }
                t.read(at.b, at.y, at.x, at.c)
            }
            Expr::Unary(op, x) => op.apply(self.eval(x, locals, at)?),
            Expr::Binary(op, a, b) => {
                op.apply(self.eval(a, locals, at)?, self.eval(b, locals, at)?)
            }
            Expr::Clamp(x, lo, hi) => {
                let (x, lo, hi) = (
                    self.eval(x, locals, at)?,
                    self.eval(lo, locals, at)?,
                    self.eval(hi, locals, at)?,
                );
                x.max(lo).min(hi)
            }
        };
        Ok(self.compute.round(v))
    }

    fn exec(&mut self, stmts: &[Stmt], at: Coord) -> Result<(), QueueError> {
        let mut locals: Vec<(String, f32)> = vec![];
        for stmt in stmts {
            match stmt {
                Stmt::Let(n, e) | Stmt::Var(n, e) => {
                    let v = self.eval(e, &locals, at)?;
                    locals.push((n.clone(), v));
                }
                Stmt::Assign(n, e) => {
                    let v = self.eval(e, &locals, at)?;
                    let slot = locals
                        .iter_mut()
                        .rev()
                        .find(|(l, _)| l == n)
                        .ok_or_else(|| submit_error(format!("`{n}` is not defined")))?;
                    slot.1 = v;
                }
                Stmt::Store(n, e) => {
                    let v = self.eval(e, &locals, at)?;
                    let (_, _, out) = self
                        .outputs
                        .iter_mut()
                        .find(|(name, _, _)| name == n)
                        .ok_or_else(|| submit_error(format!("`{n}` is not a bound output")))?;
                    let s = out.shape();
                    if at.b < s.batch() && at.y < s.height() && at.x < s.width() {
                        out.write(at.b, at.y, at.x, at.c, v);
                    }
                }
                Stmt::LinkPoint => {}
            }
        }
        Ok(())
    }
}

/// Runs one dispatch of `kernel`.
///
/// Threads are enumerated over whole work-groups and mapped to coordinates
/// the way the rendered shader maps them; threads outside the grid tensor
/// return early. Outputs are written to copies and committed at the end.
pub(super) fn run(
    kernel: &CpuKernel,
    dispatch: &Dispatch<'_>,
    tensors: &mut TensorPool,
) -> Result<(), QueueError> {
    let mut outputs = vec![];
    for (name, value) in dispatch.args.iter() {
        if let BoundValue::Tensor(handle, crate::AccessType::Write) = value {
            outputs.push((name.to_string(), *handle, tensors.get(*handle)?.clone()));
        }
    }

    let mut interpreter = Interpreter {
        dispatch,
        tensors,
        compute: kernel.precision.compute_dtype(),
        outputs,
    };

    let grid_shape = interpreter.tensor(&kernel.grid_tensor)?.shape().clone();
    let batch = grid_shape.batch().max(1);
    let extent = dispatch.work_group_count() * dispatch.work_group.max(UVec3::ONE);
    for gz in 0..extent.z as usize {
        for gy in 0..extent.y as usize {
            for gx in 0..extent.x as usize {
                let (b, x, y, s) = (gx % batch, gx / batch, gy, gz);
                if x >= grid_shape.width() || y >= grid_shape.height() || s >= grid_shape.slices()
                {
                    continue;
                }
                for lane in 0..4 {
                    let at = Coord {
                        b,
                        y,
                        x,
                        c: s * 4 + lane,
                    };
                    interpreter.exec(kernel.body.stmts(), at)?;
                }
            }
        }
    }

    let outputs = std::mem::take(&mut interpreter.outputs);
    for (_, handle, tensor) in outputs {
        *tensors.get_mut(handle)? = tensor;
    }
    Ok(())
}
