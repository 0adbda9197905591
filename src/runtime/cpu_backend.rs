//! CPU backend: evaluates an ASG node by node with `ndarray`.
//!
//! Convolutions are lowered to a single matrix product over an im2col patch
//! matrix, which is also how both convolution gradients are computed.

use super::backend::{Backend, Memo, RuntimeError};
use crate::analysis::shape_inference::{broadcast_shapes, same_output_size, ShapeInference};
use crate::asg::{Asg, NodeId, NodeType, Value};
use ndarray::{arr0, Array2, Array4, ArrayD, Axis, Ix2, Ix4, IxDyn, Zip};
use std::collections::HashMap;

type Result<T> = std::result::Result<T, RuntimeError>;

struct ExecutionContext<'a> {
    asg: &'a Asg,
    memo: Memo<Value>,
}

impl<'a> ExecutionContext<'a> {
    fn new(asg: &'a Asg, memo: Memo<Value>) -> Self {
        Self { asg, memo }
    }

    /// Value of `node_id`, computed on first use.
    fn evaluate_node(&mut self, node_id: NodeId) -> Result<Value> {
        let asg_id = self.asg.id;
        if let Some(value) = self.memo.get(&(asg_id, node_id)) {
            return Ok(value.clone());
        }

        let asg = self.asg;
        let node = asg.nodes.get(&node_id).ok_or(RuntimeError::NodeNotFound(node_id, asg_id))?;

        let result = match &node.node_type {
            NodeType::Input { name } => return Err(RuntimeError::MissingInput(name.clone(), node_id)),
            NodeType::Parameter { name } => return Err(RuntimeError::MissingParameter(name.clone(), node_id)),
            NodeType::Literal(value) => value.clone(),
            NodeType::External { name, source_asg_id, source_node_id } => self
                .memo
                .get(&(*source_asg_id, *source_node_id))
                .cloned()
                .ok_or_else(|| RuntimeError::MissingExternal {
                    name: name.clone(),
                    asg_id: *source_asg_id,
                    node_id: *source_node_id,
                })?,

            NodeType::Add(l, r) => {
                let (a, b) = self.pair(*l, *r)?;
                zip_broadcast(&a, &b, |x, y| x + y)?
            }
            NodeType::Subtract(l, r) => {
                let (a, b) = self.pair(*l, *r)?;
                zip_broadcast(&a, &b, |x, y| x - y)?
            }
            NodeType::Multiply(l, r) => {
                let (a, b) = self.pair(*l, *r)?;
                zip_broadcast(&a, &b, |x, y| x * y)?
            }
            NodeType::GreaterThan(l, r) => {
                let (a, b) = self.pair(*l, *r)?;
                zip_broadcast(&a, &b, |x, y| if x > y { 1.0 } else { 0.0 })?
            }
            NodeType::MatrixMultiply(l, r) => {
                let (a, b) = self.pair(*l, *r)?;
                op_matmul(a, b)?
            }

            NodeType::Negate(x) => Value::Tensor(self.tensor(*x)?.mapv(|v| -v)),
            NodeType::ReLU(x) => Value::Tensor(self.tensor(*x)?.mapv(|v| v.max(0.0))),
            NodeType::Sigmoid(x) => Value::Tensor(self.tensor(*x)?.mapv(sigmoid)),

            NodeType::Sum(x) => Value::Tensor(arr0(self.tensor(*x)?.sum()).into_dyn()),
            NodeType::Mean(x) => {
                let a = self.tensor(*x)?;
                let n = a.len().max(1) as f32;
                Value::Tensor(arr0(a.sum() / n).into_dyn())
            }

            NodeType::Reshape(x, per_example) => {
                let a = self.tensor(*x)?;
                let mut target = vec![a.shape().first().copied().unwrap_or(1)];
                target.extend_from_slice(per_example);
                Value::Tensor(reshape(&a, &target)?)
            }
            NodeType::ReshapeLike(x, like) => {
                let (a, b) = self.pair(*x, *like)?;
                Value::Tensor(reshape(&a, b.shape())?)
            }
            NodeType::Transpose(x, ax1, ax2) => {
                let a = self.tensor(*x)?;
                if *ax1 >= a.ndim() || *ax2 >= a.ndim() {
                    return Err(RuntimeError::ShapeError(format!(
                        "cannot swap axes {} and {} of {:?}",
                        ax1,
                        ax2,
                        a.shape()
                    )));
                }
                let mut axes: Vec<usize> = (0..a.ndim()).collect();
                axes.swap(*ax1, *ax2);
                Value::Tensor(a.permuted_axes(axes))
            }
            NodeType::Broadcast(x, target) => {
                let (a, t) = self.pair(*x, *target)?;
                let view = a.broadcast(t.shape()).ok_or_else(|| {
                    RuntimeError::ShapeError(format!("cannot broadcast {:?} to {:?}", a.shape(), t.shape()))
                })?;
                Value::Tensor(view.to_owned())
            }
            NodeType::ReduceSumTo(x, target) => {
                let (a, t) = self.pair(*x, *target)?;
                Value::Tensor(reduce_sum_to(a, t.shape())?)
            }

            NodeType::Conv2d { input, filter, stride } => {
                let (x, f) = self.pair(*input, *filter)?;
                let x = to_rank4(x, "conv2d input")?;
                let f = to_rank4(f, "conv2d filter")?;
                let geom = ConvGeometry::new(x.dim(), f.dim(), *stride)?;
                Value::Tensor(conv2d(&x, &f, &geom)?)
            }
            NodeType::Conv2dBackpropInput { grad_output, filter, input, stride } => {
                let g = self.tensor(*grad_output)?;
                let f = to_rank4(self.tensor(*filter)?, "conv2d filter")?;
                let x = self.tensor(*input)?;
                let dims = rank4_dims(x.shape(), "conv2d input")?;
                let geom = ConvGeometry::new(dims, f.dim(), *stride)?;
                Value::Tensor(conv2d_backprop_input(&g, &f, &geom)?)
            }
            NodeType::Conv2dBackpropFilter { grad_output, input, filter, stride } => {
                let g = self.tensor(*grad_output)?;
                let x = to_rank4(self.tensor(*input)?, "conv2d input")?;
                let f = self.tensor(*filter)?;
                let dims = rank4_dims(f.shape(), "conv2d filter")?;
                let geom = ConvGeometry::new(x.dim(), dims, *stride)?;
                Value::Tensor(conv2d_backprop_filter(&g, &x, &geom)?)
            }
            NodeType::ResizeBilinear { input, size } => {
                let x = to_rank4(self.tensor(*input)?, "resize input")?;
                Value::Tensor(resize_bilinear(&x, *size).into_dyn())
            }
            NodeType::ResizeBilinearGrad { grad_output, input } => {
                let g = to_rank4(self.tensor(*grad_output)?, "resize gradient")?;
                let x = self.tensor(*input)?;
                let dims = rank4_dims(x.shape(), "resize input")?;
                Value::Tensor(resize_bilinear_grad(&g, (dims.1, dims.2))?.into_dyn())
            }
        };

        self.memo.insert((asg_id, node_id), result.clone());
        Ok(result)
    }

    fn tensor(&mut self, id: NodeId) -> Result<ArrayD<f32>> {
        Ok(self.evaluate_node(id)?.into_array())
    }

    fn pair(&mut self, l: NodeId, r: NodeId) -> Result<(ArrayD<f32>, ArrayD<f32>)> {
        Ok((self.tensor(l)?, self.tensor(r)?))
    }
}

pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpuBackend {
    type DeviceData = Value;

    fn load_data(&self, data: &HashMap<String, Value>) -> Result<HashMap<String, Self::DeviceData>> {
        Ok(data.clone())
    }

    fn run(&self, main_asg: &Asg, initial_memo: Memo<Self::DeviceData>) -> Result<(Vec<Self::DeviceData>, Memo<Self::DeviceData>)> {
        let sorted_nodes = ShapeInference::topological_sort(main_asg)
            .map_err(|e| RuntimeError::ShapeError(format!("topological sort failed: {}", e)))?;

        let mut context = ExecutionContext::new(main_asg, initial_memo);
        for node_id in sorted_nodes {
            context.evaluate_node(node_id)?;
        }

        let mut results = Vec::with_capacity(main_asg.outputs.len());
        for &output in &main_asg.outputs {
            results.push(context.evaluate_node(output)?);
        }
        Ok((results, context.memo))
    }

    fn retrieve_data(&self, device_data: &[Self::DeviceData]) -> Result<Vec<Value>> {
        Ok(device_data.to_vec())
    }
}

fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Element-wise `f` after broadcasting both operands to a common shape.
fn zip_broadcast(a: &ArrayD<f32>, b: &ArrayD<f32>, f: impl Fn(f32, f32) -> f32) -> Result<Value> {
    let shape = broadcast_shapes(a.shape(), b.shape())
        .ok_or_else(|| RuntimeError::ShapeError(format!("cannot broadcast {:?} with {:?}", a.shape(), b.shape())))?;
    let (av, bv) = match (a.broadcast(shape.as_slice()), b.broadcast(shape.as_slice())) {
        (Some(av), Some(bv)) => (av, bv),
        _ => return Err(RuntimeError::ShapeError(format!("cannot broadcast to {:?}", shape))),
    };
    Ok(Value::Tensor(Zip::from(&av).and(&bv).map_collect(|&x, &y| f(x, y))))
}

fn op_matmul(a: ArrayD<f32>, b: ArrayD<f32>) -> Result<Value> {
    let a = a
        .into_dimensionality::<Ix2>()
        .map_err(|e| RuntimeError::ShapeError(format!("matmul lhs: {}", e)))?;
    let b = b
        .into_dimensionality::<Ix2>()
        .map_err(|e| RuntimeError::ShapeError(format!("matmul rhs: {}", e)))?;
    if a.ncols() != b.nrows() {
        return Err(RuntimeError::ShapeError(format!(
            "incompatible matmul shapes: {:?} and {:?}",
            a.shape(),
            b.shape()
        )));
    }
    Ok(Value::Tensor(a.dot(&b).into_dyn()))
}

/// Copies `a` in logical order into an array of shape `target`.
fn reshape(a: &ArrayD<f32>, target: &[usize]) -> Result<ArrayD<f32>> {
    ArrayD::from_shape_vec(IxDyn(target), a.iter().copied().collect())
        .map_err(|_| RuntimeError::ShapeError(format!("cannot reshape {:?} into {:?}", a.shape(), target)))
}

/// Sums `source` over the axes that were broadcast to reach its shape from
/// `target_shape`.
fn reduce_sum_to(mut source: ArrayD<f32>, target_shape: &[usize]) -> Result<ArrayD<f32>> {
    let target_rank = target_shape.len();
    while source.ndim() > target_rank {
        source = source.sum_axis(Axis(0));
    }
    for axis in (0..target_rank).rev() {
        if target_shape[axis] == 1 && source.shape()[axis] > 1 {
            source = source.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }
    if source.shape() != target_shape {
        return Err(RuntimeError::ShapeError(format!(
            "cannot reduce {:?} to {:?}",
            source.shape(),
            target_shape
        )));
    }
    Ok(source)
}

fn to_rank4(a: ArrayD<f32>, what: &str) -> Result<Array4<f32>> {
    a.into_dimensionality::<Ix4>()
        .map_err(|e| RuntimeError::ShapeError(format!("{}: {}", what, e)))
}

fn rank4_dims(shape: &[usize], what: &str) -> Result<(usize, usize, usize, usize)> {
    match *shape {
        [a, b, c, d] => Ok((a, b, c, d)),
        _ => Err(RuntimeError::ShapeError(format!("{}: expected rank 4, got {:?}", what, shape))),
    }
}

/// Sizes of a SAME-padded NHWC convolution with an HWIO filter.
struct ConvGeometry {
    batch: usize,
    in_h: usize,
    in_w: usize,
    in_c: usize,
    k_h: usize,
    k_w: usize,
    out_c: usize,
    stride_h: usize,
    stride_w: usize,
    out_h: usize,
    out_w: usize,
    pad_top: usize,
    pad_left: usize,
}

impl ConvGeometry {
    fn new(
        input: (usize, usize, usize, usize),
        filter: (usize, usize, usize, usize),
        stride: (usize, usize),
    ) -> Result<Self> {
        let (batch, in_h, in_w, in_c) = input;
        let (k_h, k_w, f_in, out_c) = filter;
        if f_in != in_c {
            return Err(RuntimeError::ShapeError(format!(
                "conv2d: input has {} channels, filter expects {}",
                in_c, f_in
            )));
        }
        let (stride_h, stride_w) = stride;
        if stride_h == 0 || stride_w == 0 {
            return Err(RuntimeError::ShapeError("conv2d: zero stride".to_string()));
        }
        let out_h = same_output_size(in_h, stride_h);
        let out_w = same_output_size(in_w, stride_w);
        let pad_h = ((out_h.saturating_sub(1)) * stride_h + k_h).saturating_sub(in_h);
        let pad_w = ((out_w.saturating_sub(1)) * stride_w + k_w).saturating_sub(in_w);
        Ok(Self {
            batch,
            in_h,
            in_w,
            in_c,
            k_h,
            k_w,
            out_c,
            stride_h,
            stride_w,
            out_h,
            out_w,
            pad_top: pad_h / 2,
            pad_left: pad_w / 2,
        })
    }

    fn rows(&self) -> usize {
        self.batch * self.out_h * self.out_w
    }

    fn patch_len(&self) -> usize {
        self.k_h * self.k_w * self.in_c
    }

    /// Input coordinate read by output `(oy, ox)` at kernel tap `(ky, kx)`,
    /// or `None` inside the zero padding.
    fn source(&self, oy: usize, ox: usize, ky: usize, kx: usize) -> Option<(usize, usize)> {
        let iy = (oy * self.stride_h + ky).checked_sub(self.pad_top)?;
        let ix = (ox * self.stride_w + kx).checked_sub(self.pad_left)?;
        (iy < self.in_h && ix < self.in_w).then_some((iy, ix))
    }

    /// Visits every (patch row, patch column, input position) triple.
    fn for_each_tap(&self, mut f: impl FnMut(usize, usize, (usize, usize, usize))) {
        for b in 0..self.batch {
            for oy in 0..self.out_h {
                for ox in 0..self.out_w {
                    let row = (b * self.out_h + oy) * self.out_w + ox;
                    for ky in 0..self.k_h {
                        for kx in 0..self.k_w {
                            if let Some((iy, ix)) = self.source(oy, ox, ky, kx) {
                                let col = (ky * self.k_w + kx) * self.in_c;
                                f(row, col, (b, iy, ix));
                            }
                        }
                    }
                }
            }
        }
    }
}

fn im2col(x: &Array4<f32>, geom: &ConvGeometry) -> Array2<f32> {
    let mut cols = Array2::zeros((geom.rows(), geom.patch_len()));
    geom.for_each_tap(|row, col, (b, iy, ix)| {
        for c in 0..geom.in_c {
            cols[[row, col + c]] = x[[b, iy, ix, c]];
        }
    });
    cols
}

fn col2im(cols: &Array2<f32>, geom: &ConvGeometry) -> Array4<f32> {
    let mut x = Array4::zeros((geom.batch, geom.in_h, geom.in_w, geom.in_c));
    geom.for_each_tap(|row, col, (b, iy, ix)| {
        for c in 0..geom.in_c {
            x[[b, iy, ix, c]] += cols[[row, col + c]];
        }
    });
    x
}

fn filter_matrix(f: &Array4<f32>, geom: &ConvGeometry) -> Result<Array2<f32>> {
    Array2::from_shape_vec((geom.patch_len(), geom.out_c), f.iter().copied().collect())
        .map_err(|e| RuntimeError::ShapeError(format!("conv2d filter: {}", e)))
}

fn grad_matrix(g: &ArrayD<f32>, geom: &ConvGeometry) -> Result<Array2<f32>> {
    let expected = [geom.batch, geom.out_h, geom.out_w, geom.out_c];
    if g.shape() != expected {
        return Err(RuntimeError::ShapeError(format!(
            "conv2d gradient: expected {:?}, got {:?}",
            expected,
            g.shape()
        )));
    }
    Array2::from_shape_vec((geom.rows(), geom.out_c), g.iter().copied().collect())
        .map_err(|e| RuntimeError::ShapeError(format!("conv2d gradient: {}", e)))
}

fn conv2d(x: &Array4<f32>, f: &Array4<f32>, geom: &ConvGeometry) -> Result<ArrayD<f32>> {
    let out = im2col(x, geom).dot(&filter_matrix(f, geom)?);
    reshape(&out.into_dyn(), &[geom.batch, geom.out_h, geom.out_w, geom.out_c])
}

fn conv2d_backprop_input(g: &ArrayD<f32>, f: &Array4<f32>, geom: &ConvGeometry) -> Result<ArrayD<f32>> {
    let dcols = grad_matrix(g, geom)?.dot(&filter_matrix(f, geom)?.t());
    Ok(col2im(&dcols, geom).into_dyn())
}

fn conv2d_backprop_filter(g: &ArrayD<f32>, x: &Array4<f32>, geom: &ConvGeometry) -> Result<ArrayD<f32>> {
    let df = im2col(x, geom).t().dot(&grad_matrix(g, geom)?);
    reshape(&df.into_dyn(), &[geom.k_h, geom.k_w, geom.in_c, geom.out_c])
}

/// For each output position along one axis: the two source indices and the
/// weight of the second one.
fn interpolation(in_size: usize, out_size: usize) -> Vec<(usize, usize, f32)> {
    let scale = in_size as f32 / out_size as f32;
    (0..out_size)
        .map(|o| {
            let src = o as f32 * scale;
            let lo = (src.floor() as usize).min(in_size - 1);
            let hi = (lo + 1).min(in_size - 1);
            (lo, hi, src - lo as f32)
        })
        .collect()
}

fn resize_bilinear(x: &Array4<f32>, size: (usize, usize)) -> Array4<f32> {
    let (n, in_h, in_w, c) = x.dim();
    let (out_h, out_w) = size;
    let mut out = Array4::zeros((n, out_h, out_w, c));
    if in_h == 0 || in_w == 0 {
        return out;
    }
    let ys = interpolation(in_h, out_h);
    let xs = interpolation(in_w, out_w);
    for b in 0..n {
        for (oy, &(y0, y1, dy)) in ys.iter().enumerate() {
            for (ox, &(x0, x1, dx)) in xs.iter().enumerate() {
                for ch in 0..c {
                    let top = x[[b, y0, x0, ch]] + (x[[b, y0, x1, ch]] - x[[b, y0, x0, ch]]) * dx;
                    let bottom = x[[b, y1, x0, ch]] + (x[[b, y1, x1, ch]] - x[[b, y1, x0, ch]]) * dx;
                    out[[b, oy, ox, ch]] = top + (bottom - top) * dy;
                }
            }
        }
    }
    out
}

/// Scatters each output gradient back onto the four pixels it was
/// interpolated from.
fn resize_bilinear_grad(g: &Array4<f32>, in_size: (usize, usize)) -> Result<Array4<f32>> {
    let (n, out_h, out_w, c) = g.dim();
    let (in_h, in_w) = in_size;
    let mut dx_arr = Array4::zeros((n, in_h, in_w, c));
    if in_h == 0 || in_w == 0 {
        return Ok(dx_arr);
    }
    let ys = interpolation(in_h, out_h);
    let xs = interpolation(in_w, out_w);
    for b in 0..n {
        for (oy, &(y0, y1, dy)) in ys.iter().enumerate() {
            for (ox, &(x0, x1, dx)) in xs.iter().enumerate() {
                for ch in 0..c {
                    let grad = g[[b, oy, ox, ch]];
                    dx_arr[[b, y0, x0, ch]] += grad * (1.0 - dy) * (1.0 - dx);
                    dx_arr[[b, y0, x1, ch]] += grad * (1.0 - dy) * dx;
                    dx_arr[[b, y1, x0, ch]] += grad * dy * (1.0 - dx);
                    dx_arr[[b, y1, x1, ch]] += grad * dy * dx;
                }
            }
        }
    }
    Ok(dx_arr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array};

    fn geometry(input: (usize, usize, usize, usize), filter: (usize, usize, usize, usize), stride: usize) -> ConvGeometry {
        ConvGeometry::new(input, filter, (stride, stride)).unwrap()
    }

    #[test]
    fn same_padding_keeps_size_at_stride_one() {
        let geom = geometry((1, 28, 28, 1), (3, 3, 1, 16), 1);
        assert_eq!((geom.out_h, geom.out_w), (28, 28));
        assert_eq!((geom.pad_top, geom.pad_left), (1, 1));
    }

    #[test]
    fn same_padding_at_stride_two_pads_after() {
        // out = 14, total padding = 13*2 + 3 - 28 = 1, all of it after.
        let geom = geometry((1, 28, 28, 1), (3, 3, 1, 16), 2);
        assert_eq!((geom.out_h, geom.out_w), (14, 14));
        assert_eq!((geom.pad_top, geom.pad_left), (0, 0));
    }

    #[test]
    fn conv_with_centre_tap_is_identity() {
        let x = Array::from_shape_fn((2, 4, 4, 1), |(b, y, x, _)| (b * 16 + y * 4 + x) as f32);
        let mut f = Array4::zeros((3, 3, 1, 1));
        f[[1, 1, 0, 0]] = 1.0;
        let geom = geometry(x.dim(), f.dim(), 1);
        let y = conv2d(&x, &f, &geom).unwrap();
        assert_eq!(y, x.into_dyn());
    }

    #[test]
    fn conv_sums_the_padded_neighbourhood() {
        let x = Array4::from_elem((1, 3, 3, 1), 1.0);
        let f = Array4::from_elem((3, 3, 1, 1), 1.0);
        let geom = geometry(x.dim(), f.dim(), 1);
        let y = conv2d(&x, &f, &geom).unwrap();
        let expected = array![[4.0f32, 6.0, 4.0], [6.0, 9.0, 6.0], [4.0, 6.0, 4.0]];
        assert_eq!(y.into_shape((3, 3)).unwrap(), expected);
    }

    #[test]
    fn resize_doubles_with_legacy_mapping() {
        let x = array![[1.0f32, 3.0], [5.0, 7.0]].into_shape((1, 2, 2, 1)).unwrap();
        let y = resize_bilinear(&x, (4, 4));
        let row0: Vec<f32> = (0..4).map(|i| y[[0, 0, i, 0]]).collect();
        assert_eq!(row0, vec![1.0, 2.0, 3.0, 3.0]);
        let col0: Vec<f32> = (0..4).map(|i| y[[0, i, 0, 0]]).collect();
        assert_eq!(col0, vec![1.0, 3.0, 5.0, 5.0]);
    }

    #[test]
    fn resize_gradient_preserves_total_mass() {
        let g = Array4::from_elem((1, 28, 28, 1), 1.0);
        let dx = resize_bilinear_grad(&g, (14, 14)).unwrap();
        assert!((dx.sum() - 784.0).abs() < 1e-3);
    }

    #[test]
    fn reduce_sum_to_undoes_broadcast() {
        let g = ArrayD::from_elem(IxDyn(&[4, 3]), 1.0);
        assert_eq!(reduce_sum_to(g.clone(), &[1, 3]).unwrap(), ArrayD::from_elem(IxDyn(&[1, 3]), 4.0));
        assert_eq!(reduce_sum_to(g, &[]).unwrap(), arr0(12.0).into_dyn());
    }
}
