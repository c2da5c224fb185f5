//! Logical vectors partitioned across devices
//!
//! A [`Vector`] presents one contiguous sequence of elements to the caller
//! while its storage is split into one device buffer per queue, following
//! the [`Layout`] computed by the partition manager.
//!
//! Assignment from an expression is asynchronous: kernels are enqueued on
//! every device and the call returns. Data movement to and from the host,
//! element access and [`Vector::finish`] block.
//!
//! ```ignore
//! let queues = CpuRuntime::queue_list(2)?;
//! let x = Vector::<f32, CpuRuntime>::from_slice(&queues, &host)?;
//! let y = Vector::<f32, CpuRuntime>::new(&queues, host.len())?;
//! y.assign(2.0f32 * &x)?;
//! let out = y.to_vec()?;
//! ```

use std::marker::PhantomData;

use crate::dtype::Element;
use crate::error::{Error, Result};
use crate::fusion::{self, AssignOp, Expr};
use crate::partition::{self, Layout};
use crate::runtime::{Event, Runtime, RuntimeClient};

/// Intended access pattern of a vector's device buffers
///
/// Informational only: every buffer is allocated read-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemFlags {
    /// Kernels only read the vector
    ReadOnly,
    /// Kernels only write the vector
    WriteOnly,
    /// Kernels read and write the vector
    #[default]
    ReadWrite,
}

/// One device buffer, released on drop behind all work queued on its device
struct DeviceBuffer<R: Runtime> {
    ptr: u64,
    bytes: usize,
    client: R::Client,
}

impl<R: Runtime> DeviceBuffer<R> {
    fn new(bytes: usize, client: &R::Client) -> Result<Self> {
        Ok(Self {
            ptr: R::allocate(bytes, client)?,
            bytes,
            client: client.clone(),
        })
    }

    fn write<T: Element>(&self, data: &[T]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        R::copy_to_device(bytemuck::cast_slice(data), self.ptr, 0, &self.client)?.wait()
    }

    fn read<T: Element>(&self, out: &mut [T]) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        R::copy_from_device(self.ptr, 0, bytemuck::cast_slice_mut(out), &self.client)
    }
}

impl<R: Runtime> Drop for DeviceBuffer<R> {
    fn drop(&mut self) {
        R::deallocate(self.ptr, self.bytes, &self.client);
    }
}

/// A logical vector of `T` partitioned over a list of device queues
pub struct Vector<T: Element, R: Runtime> {
    queues: Vec<R::Client>,
    buffers: Vec<DeviceBuffer<R>>,
    layout: Layout,
    flags: MemFlags,
    _marker: PhantomData<T>,
}

impl<T: Element, R: Runtime> std::fmt::Debug for Vector<T, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vector")
            .field("dtype", &T::DTYPE)
            .field("layout", &format_args!("{}", self.layout))
            .field("flags", &self.flags)
            .finish()
    }
}

impl<T: Element, R: Runtime> Vector<T, R> {
    /// Zero-initialised vector of `n` elements partitioned over `queues`
    pub fn new(queues: &[R::Client], n: usize) -> Result<Self> {
        Self::with_flags(queues, n, MemFlags::default())
    }

    /// Like [`Vector::new`], recording the intended access pattern
    pub fn with_flags(queues: &[R::Client], n: usize, flags: MemFlags) -> Result<Self> {
        let layout = partition::layout::<R>(queues, n)?;
        Self::with_layout(queues, layout, flags)
    }

    /// Vector with explicit partition sizes, one per queue
    ///
    /// Useful to pin a particular split; vectors created with
    /// [`Vector::new`] can only be combined with this one if their computed
    /// layout happens to match.
    pub fn with_partition(queues: &[R::Client], sizes: &[usize]) -> Result<Self> {
        let devices: Vec<_> = queues.iter().map(|q| q.key()).collect();
        let layout = Layout::from_sizes(&devices, sizes)?;
        Self::with_layout(queues, layout, MemFlags::default())
    }

    fn with_layout(queues: &[R::Client], layout: Layout, flags: MemFlags) -> Result<Self> {
        let buffers = queues
            .iter()
            .zip(layout.parts())
            .map(|(q, part)| DeviceBuffer::new(part.len * std::mem::size_of::<T>(), q))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            queues: queues.to_vec(),
            buffers,
            layout,
            flags,
            _marker: PhantomData,
        })
    }

    /// Vector holding a copy of `data`
    pub fn from_slice(queues: &[R::Client], data: &[T]) -> Result<Self> {
        let v = Self::new(queues, data.len())?;
        v.write_from(data)?;
        Ok(v)
    }

    /// New vector holding the value of `expr`
    ///
    /// The result is partitioned like the expression's first vector operand.
    /// Expressions without a vector operand have no length and are rejected.
    pub fn from_expr<'a>(expr: impl Into<Expr<'a, T, R>>) -> Result<Self> {
        let expr = expr.into();
        let like = expr.first_vector().ok_or_else(|| {
            Error::invalid_argument("expr", "expression has no vector operand")
        })?;
        let v = Self::with_layout(&like.queues, like.layout.clone(), MemFlags::default())?;
        v.assign(expr)?;
        Ok(v)
    }

    /// Number of elements
    #[inline]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Whether the vector has no elements
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue list the vector is partitioned over
    pub fn queues(&self) -> &[R::Client] {
        &self.queues
    }

    /// Partition layout
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Access flags given at construction
    pub fn flags(&self) -> MemFlags {
        self.flags
    }

    /// Number of partitions (one per queue)
    pub fn num_parts(&self) -> usize {
        self.buffers.len()
    }

    /// Device buffer handle of partition `d`
    ///
    /// Handles of empty partitions are `0`.
    ///
    /// # Panics
    ///
    /// Panics if `d >= self.num_parts()`.
    pub fn buffer(&self, d: usize) -> u64 {
        self.buffers[d].ptr
    }

    /// Number of elements in partition `d`
    ///
    /// # Panics
    ///
    /// Panics if `d >= self.num_parts()`.
    pub fn part_size(&self, d: usize) -> usize {
        self.layout.parts()[d].len
    }

    /// Global index of the first element of partition `d`
    ///
    /// # Panics
    ///
    /// Panics if `d >= self.num_parts()`.
    pub fn part_start(&self, d: usize) -> usize {
        self.layout.parts()[d].start
    }

    /// Copy `data` into the vector, all partitions in parallel (blocking)
    pub fn write_from(&self, data: &[T]) -> Result<()> {
        self.check_host_len(data.len())?;
        let jobs: Vec<(&DeviceBuffer<R>, &[T])> = self
            .buffers
            .iter()
            .zip(self.layout.parts())
            .map(|(buf, part)| (buf, &data[part.start..part.end()]))
            .collect();

        #[cfg(feature = "rayon")]
        {
            use rayon::prelude::*;
            jobs.into_par_iter().try_for_each(|(buf, chunk)| buf.write(chunk))
        }
        #[cfg(not(feature = "rayon"))]
        {
            jobs.into_iter().try_for_each(|(buf, chunk)| buf.write(chunk))
        }
    }

    /// Copy the vector into `out`, all partitions in parallel (blocking)
    ///
    /// Waits for every kernel already enqueued on the vector's devices.
    pub fn read_into(&self, out: &mut [T]) -> Result<()> {
        self.check_host_len(out.len())?;
        let mut jobs: Vec<(&DeviceBuffer<R>, &mut [T])> = Vec::with_capacity(self.num_parts());
        let mut rest = out;
        for (buf, part) in self.buffers.iter().zip(self.layout.parts()) {
            let (chunk, tail) = std::mem::take(&mut rest).split_at_mut(part.len);
            jobs.push((buf, chunk));
            rest = tail;
        }

        #[cfg(feature = "rayon")]
        {
            use rayon::prelude::*;
            jobs.into_par_iter().try_for_each(|(buf, chunk)| buf.read(chunk))
        }
        #[cfg(not(feature = "rayon"))]
        {
            jobs.into_iter().try_for_each(|(buf, chunk)| buf.read(chunk))
        }
    }

    /// Copy the whole vector to a new host `Vec` (blocking)
    pub fn to_vec(&self) -> Result<Vec<T>> {
        let mut out = vec![T::zero(); self.len()];
        self.read_into(&mut out)?;
        Ok(out)
    }

    fn check_host_len(&self, len: usize) -> Result<()> {
        if len != self.len() {
            return Err(Error::invalid_argument(
                "data",
                format!("host slice has {len} elements, vector has {}", self.len()),
            ));
        }
        Ok(())
    }

    /// Read element `i` (blocking)
    ///
    /// Each call is a separate device transfer; use [`Vector::read_into`]
    /// for anything but occasional access.
    pub fn get(&self, i: usize) -> Result<T> {
        let (d, offset) = self.locate(i)?;
        let mut value = [T::zero()];
        R::copy_from_device(
            self.buffers[d].ptr,
            offset * std::mem::size_of::<T>(),
            bytemuck::cast_slice_mut(&mut value),
            &self.queues[d],
        )?;
        Ok(value[0])
    }

    /// Write element `i` (blocking)
    ///
    /// Same cost caveat as [`Vector::get`].
    pub fn set(&self, i: usize, value: T) -> Result<()> {
        let (d, offset) = self.locate(i)?;
        R::copy_to_device(
            bytemuck::bytes_of(&value),
            self.buffers[d].ptr,
            offset * std::mem::size_of::<T>(),
            &self.queues[d],
        )?
        .wait()
    }

    fn locate(&self, i: usize) -> Result<(usize, usize)> {
        self.layout.locate(i).ok_or(Error::IndexOutOfBounds {
            index: i,
            size: self.len(),
        })
    }

    /// Set every element to `value` (asynchronous)
    pub fn fill(&self, value: T) -> Result<()> {
        self.update(AssignOp::Set, Expr::<T, R>::Scalar(value))
    }

    /// `self = expr`, as one fused kernel per device (asynchronous)
    pub fn assign<'a>(&self, expr: impl Into<Expr<'a, T, R>>) -> Result<()> {
        self.update(AssignOp::Set, expr)
    }

    /// `self += expr`
    pub fn assign_add<'a>(&self, expr: impl Into<Expr<'a, T, R>>) -> Result<()> {
        self.update(AssignOp::Add, expr)
    }

    /// `self -= expr`
    pub fn assign_sub<'a>(&self, expr: impl Into<Expr<'a, T, R>>) -> Result<()> {
        self.update(AssignOp::Sub, expr)
    }

    /// `self *= expr`
    pub fn assign_mul<'a>(&self, expr: impl Into<Expr<'a, T, R>>) -> Result<()> {
        self.update(AssignOp::Mul, expr)
    }

    /// `self /= expr`
    pub fn assign_div<'a>(&self, expr: impl Into<Expr<'a, T, R>>) -> Result<()> {
        self.update(AssignOp::Div, expr)
    }

    /// Store `expr` into the vector with `op` (asynchronous)
    ///
    /// Device errors raised by the kernels surface at the next blocking call
    /// on the same devices.
    pub fn update<'a>(&self, op: AssignOp, expr: impl Into<Expr<'a, T, R>>) -> Result<()> {
        self.enqueue(op, expr).map(drop)
    }

    /// Like [`Vector::update`], returning the launch events
    ///
    /// Empty partitions launch nothing, so there may be fewer events than
    /// partitions.
    pub fn enqueue<'a>(
        &self,
        op: AssignOp,
        expr: impl Into<Expr<'a, T, R>>,
    ) -> Result<Vec<R::Event>> {
        fusion::enqueue_assign(self, op, &expr.into())
    }

    /// Wait for all work queued on the vector's devices
    pub fn finish(&self) -> Result<()> {
        let mut first = None;
        for q in &self.queues {
            if let Err(e) = q.synchronize() {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

/// Copy host data into a vector (blocking)
pub fn copy_to_device<T: Element, R: Runtime>(src: &[T], dst: &Vector<T, R>) -> Result<()> {
    dst.write_from(src)
}

/// Copy a vector into host memory (blocking)
pub fn copy_to_host<T: Element, R: Runtime>(src: &Vector<T, R>, dst: &mut [T]) -> Result<()> {
    src.read_into(dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::sqrt;
    use crate::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};

    fn queues(ids: &[usize]) -> Vec<CpuClient> {
        ids.iter()
            .map(|&id| CpuClient::new(CpuDevice::new(id)).unwrap())
            .collect()
    }

    #[test]
    fn test_roundtrip_across_partitions() {
        let q = queues(&[80, 81]);
        let host: Vec<f64> = (0..37).map(|i| i as f64 * 0.5).collect();
        let v = Vector::<f64, CpuRuntime>::with_partition(&q, &[20, 17]).unwrap();
        copy_to_device(&host, &v).unwrap();

        let mut back = vec![0.0; 37];
        copy_to_host(&v, &mut back).unwrap();
        assert_eq!(back, host);
        assert_eq!(v.part_start(1), 20);
        assert_eq!(v.part_size(1), 17);
    }

    #[test]
    fn test_host_length_must_match() {
        let q = queues(&[80]);
        let v = Vector::<f32, CpuRuntime>::new(&q, 4).unwrap();
        assert!(matches!(
            v.write_from(&[1.0; 5]),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_element_access_crosses_partition_boundary() {
        let q = queues(&[80, 81]);
        let v = Vector::<i32, CpuRuntime>::with_partition(&q, &[3, 3]).unwrap();
        v.set(2, 7).unwrap();
        v.set(3, -7).unwrap();
        assert_eq!(v.get(2).unwrap(), 7);
        assert_eq!(v.get(3).unwrap(), -7);
        assert_eq!(v.to_vec().unwrap(), vec![0, 0, 7, -7, 0, 0]);
        assert!(matches!(
            v.get(6),
            Err(Error::IndexOutOfBounds { index: 6, size: 6 })
        ));
    }

    #[test]
    fn test_fill_then_compound_assign() {
        let q = queues(&[80, 81]);
        let v = Vector::<f32, CpuRuntime>::with_partition(&q, &[5, 4]).unwrap();
        v.fill(4.0).unwrap();
        v.assign_mul(sqrt(&v)).unwrap();
        v.assign_sub(1.0f32).unwrap();
        assert_eq!(v.to_vec().unwrap(), vec![7.0; 9]);
    }

    #[test]
    fn test_from_expr_copies_layout() {
        let q = queues(&[80, 81]);
        let x = Vector::<u32, CpuRuntime>::with_partition(&q, &[1, 3]).unwrap();
        x.write_from(&[1, 2, 3, 4]).unwrap();
        let y = Vector::<u32, CpuRuntime>::from_expr(&x * 3u32).unwrap();
        assert_eq!(y.layout(), x.layout());
        assert_eq!(y.to_vec().unwrap(), vec![3, 6, 9, 12]);

        let scalar_only = Expr::<u32, CpuRuntime>::Scalar(1);
        assert!(Vector::<u32, CpuRuntime>::from_expr(scalar_only).is_err());
    }

    #[test]
    fn test_empty_partitions_are_skipped() {
        let q = queues(&[80, 81, 82]);
        let v = Vector::<f32, CpuRuntime>::with_partition(&q, &[0, 2, 0]).unwrap();
        assert_eq!(v.buffer(0), 0);
        let events = v.enqueue(AssignOp::Set, Expr::<f32, CpuRuntime>::Scalar(3.0)).unwrap();
        assert_eq!(events.len(), 1);
        crate::runtime::wait_all(events).unwrap();
        assert_eq!(v.to_vec().unwrap(), vec![3.0, 3.0]);
    }
}
