//! Collective communication across the devices of one process
//!
//! One communicator per device is created in a single call, then every
//! device's all-reduce is issued from this thread inside a group bracket:
//!
//! ```text
//! group start
//!     all_reduce(rank 0, send[0] -> recv[0], stream[0])
//!     all_reduce(rank 1, send[1] -> recv[1], stream[1])
//!     ...
//! group end            (the library launches all of them together)
//! stream sync per device
//! ```
//!
//! Without the bracket a single thread would block inside the first call
//! waiting for peers that it has not issued yet.

use tracing::{debug, info};

#[cfg(feature = "cuda")]
use crate::error::check_nccl;
use crate::error::{ReduceError, Result};
use crate::gpu::{DeviceStream, MultiGpuContext};
use crate::memory::DeviceBuffer;
use crate::tensor::{DType, ReduceOp};

#[cfg(feature = "cuda")]
use cudarc::nccl::sys;

/// Turn a raw collective-library status into a result carrying the library's message
#[cfg(feature = "cuda")]
fn nccl_status(res: sys::ncclResult_t) -> std::result::Result<(), String> {
    if res == sys::ncclResult_t::ncclSuccess {
        return Ok(());
    }
    // SAFETY: ncclGetErrorString returns a static NUL-terminated string
    let message = unsafe { std::ffi::CStr::from_ptr(sys::ncclGetErrorString(res)) };
    Err(message.to_string_lossy().into_owned())
}

/// One communicator per participating device
pub struct CommGroup {
    #[cfg(feature = "cuda")]
    comms: Vec<sys::ncclComm_t>,
    ordinals: Vec<usize>,
}

impl CommGroup {
    /// Create communicators for every device of `ctx`; rank i is `ctx.device(i)`
    #[track_caller]
    pub fn init_all(ctx: &MultiGpuContext) -> Result<Self> {
        let ordinals = ctx.ordinals();
        if ordinals.is_empty() {
            return Err(ReduceError::Collective("no devices to initialize".into()));
        }

        #[cfg(feature = "cuda")]
        let comms = {
            use std::ffi::c_int;
            let devlist: Vec<c_int> = ordinals.iter().map(|&d| d as c_int).collect();
            let mut comms: Vec<sys::ncclComm_t> = vec![std::ptr::null_mut(); ordinals.len()];
            // SAFETY: comms has room for one handle per entry of devlist
            let res = unsafe { sys::ncclCommInitAll(comms.as_mut_ptr(), devlist.len() as c_int, devlist.as_ptr()) };
            check_nccl(nccl_status(res), "ncclCommInitAll")?;
            comms
        };

        info!("Initialized {} communicators over devices {:?}", ordinals.len(), ordinals);
        Ok(Self {
            #[cfg(feature = "cuda")]
            comms,
            ordinals,
        })
    }

    pub fn world_size(&self) -> usize {
        self.ordinals.len()
    }

    /// Device ordinal of `rank`
    pub fn rank_device(&self, rank: usize) -> Option<usize> {
        self.ordinals.get(rank).copied()
    }

    /// Open a group bracket; calls issued on the returned handle launch at `end()`
    #[track_caller]
    pub fn group(&self) -> Result<GroupCall<'_>> {
        #[cfg(feature = "cuda")]
        {
            // SAFETY: plain library call, balanced by ncclGroupEnd in end()/drop
            check_nccl(nccl_status(unsafe { sys::ncclGroupStart() }), "ncclGroupStart")?;
        }
        Ok(GroupCall {
            group: self,
            issued: vec![None; self.world_size()],
            #[cfg(not(feature = "cuda"))]
            staged: Vec::new(),
            open: true,
        })
    }

    /// All-reduce `count` elements of every send buffer into every receive buffer
    ///
    /// `sends[i]`, `recvs[i]` and `streams[i]` belong to rank i.
    pub fn all_reduce_grouped(
        &self,
        sends: &[Box<dyn DeviceBuffer>],
        recvs: &mut [Box<dyn DeviceBuffer>],
        count: usize,
        dtype: DType,
        op: ReduceOp,
        streams: &[DeviceStream],
    ) -> Result<()> {
        let n = self.world_size();
        if sends.len() != n || recvs.len() != n || streams.len() != n {
            return Err(ReduceError::Collective(format!(
                "expected {} send/recv/stream entries, got {}/{}/{}",
                n,
                sends.len(),
                recvs.len(),
                streams.len()
            )));
        }

        let mut call = self.group()?;
        for (rank, ((send, recv), stream)) in sends.iter().zip(recvs.iter_mut()).zip(streams).enumerate() {
            call.all_reduce(rank, send.as_ref(), recv.as_mut(), count, dtype, op, stream)?;
        }
        call.end()
    }
}

#[cfg(feature = "cuda")]
impl Drop for CommGroup {
    fn drop(&mut self) {
        for &comm in &self.comms {
            // SAFETY: each handle came from ncclCommInitAll and is destroyed once
            let _ = unsafe { sys::ncclCommDestroy(comm) };
        }
    }
}

impl std::fmt::Debug for CommGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommGroup")
            .field("world_size", &self.world_size())
            .field("ordinals", &self.ordinals)
            .finish()
    }
}

/// Shape of one issued collective call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CallShape {
    count: usize,
    dtype: DType,
    op: ReduceOp,
}

#[cfg(not(feature = "cuda"))]
struct Staged<'a> {
    rank: usize,
    send: &'a dyn DeviceBuffer,
    recv: &'a mut dyn DeviceBuffer,
}

/// An open group bracket
pub struct GroupCall<'a> {
    group: &'a CommGroup,
    issued: Vec<Option<CallShape>>,
    #[cfg(not(feature = "cuda"))]
    staged: Vec<Staged<'a>>,
    open: bool,
}

impl<'a> GroupCall<'a> {
    /// Issue rank `rank`'s all-reduce on `stream`
    #[allow(clippy::too_many_arguments)]
    #[track_caller]
    pub fn all_reduce(
        &mut self,
        rank: usize,
        send: &'a dyn DeviceBuffer,
        recv: &'a mut dyn DeviceBuffer,
        count: usize,
        dtype: DType,
        op: ReduceOp,
        stream: &DeviceStream,
    ) -> Result<()> {
        let device = self
            .group
            .rank_device(rank)
            .ok_or_else(|| ReduceError::Collective(format!("rank {} outside group of {}", rank, self.group.world_size())))?;
        if self.issued[rank].is_some() {
            return Err(ReduceError::Collective(format!("rank {} issued twice in one group", rank)));
        }
        for (what, on) in [
            ("send buffer", send.device_id()),
            ("receive buffer", recv.device_id()),
            ("stream", stream.device().device_id),
        ] {
            if on != device {
                return Err(ReduceError::Collective(format!(
                    "rank {} runs on GPU {} but its {} is on GPU {}",
                    rank, device, what, on
                )));
            }
        }
        let nbytes = count * dtype.size_bytes();
        if send.len_bytes() < nbytes || recv.len_bytes() < nbytes {
            return Err(ReduceError::Collective(format!(
                "rank {}: {} elements of {} need {} bytes, buffers hold {}/{}",
                rank,
                count,
                dtype,
                nbytes,
                send.len_bytes(),
                recv.len_bytes()
            )));
        }

        #[cfg(feature = "cuda")]
        {
            use std::ffi::c_void;
            // SAFETY: buffers hold at least `count` elements on this rank's device
            // and stay alive until the caller synchronizes the stream
            let res = unsafe {
                sys::ncclAllReduce(
                    send.device_ptr() as *const c_void,
                    recv.device_ptr() as *mut c_void,
                    count,
                    dtype.nccl_type(),
                    op.nccl_op(),
                    self.group.comms[rank],
                    stream.raw() as sys::cudaStream_t,
                )
            };
            check_nccl(nccl_status(res), "ncclAllReduce")?;
        }
        #[cfg(not(feature = "cuda"))]
        self.staged.push(Staged { rank, send, recv });

        debug!(rank, device, count, %dtype, %op, "queued all-reduce");
        self.issued[rank] = Some(CallShape { count, dtype, op });
        Ok(())
    }

    /// Close the bracket and launch the queued calls
    #[track_caller]
    pub fn end(mut self) -> Result<()> {
        self.open = false;

        #[cfg(feature = "cuda")]
        {
            // SAFETY: balances the ncclGroupStart issued in CommGroup::group
            check_nccl(nccl_status(unsafe { sys::ncclGroupEnd() }), "ncclGroupEnd")?;
        }

        let shape = self.check_complete()?;

        #[cfg(not(feature = "cuda"))]
        self.reduce_staged(shape)?;
        #[cfg(feature = "cuda")]
        let _ = shape;

        Ok(())
    }

    /// Every rank issued exactly one call and all calls agree
    fn check_complete(&self) -> Result<CallShape> {
        let missing: Vec<usize> = self
            .issued
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(r, _)| r)
            .collect();
        if !missing.is_empty() {
            return Err(ReduceError::Collective(format!("ranks {:?} did not join the collective", missing)));
        }
        let first = self.issued[0].ok_or_else(|| ReduceError::Collective("empty group".into()))?;
        if let Some(rank) = self.issued.iter().position(|s| *s != Some(first)) {
            return Err(ReduceError::Collective(format!(
                "rank {} issued {:?}, rank 0 issued {:?}",
                rank, self.issued[rank], first
            )));
        }
        Ok(first)
    }

    /// Host fallback: read every send buffer, reduce, write every receive buffer
    #[cfg(not(feature = "cuda"))]
    fn reduce_staged(&mut self, shape: CallShape) -> Result<()> {
        self.staged.sort_by_key(|s| s.rank);
        let inputs = self
            .staged
            .iter()
            .map(|s| s.send.read())
            .collect::<Result<Vec<_>>>()?;

        let nbytes = shape.count * shape.dtype.size_bytes();
        let mut reduced = vec![0u8; nbytes];
        crate::tensor::reduce_into(shape.dtype, shape.op, shape.count, &inputs, &mut reduced)?;

        for staged in self.staged.iter_mut() {
            if staged.recv.len_bytes() == nbytes {
                staged.recv.write(&reduced)?;
            } else {
                let mut full = staged.recv.read()?;
                full[..nbytes].copy_from_slice(&reduced);
                staged.recv.write(&full)?;
            }
        }
        Ok(())
    }
}

impl Drop for GroupCall<'_> {
    fn drop(&mut self) {
        if self.open {
            #[cfg(feature = "cuda")]
            {
                // SAFETY: balances the ncclGroupStart of an abandoned bracket
                let _ = unsafe { sys::ncclGroupEnd() };
            }
            tracing::warn!("collective group dropped without end()");
        }
    }
}

#[cfg(all(test, not(feature = "cuda")))]
mod tests {
    use super::*;
    use crate::memory::{BufferAllocator, DirectAllocator};

    fn f32_buffer(ctx: &MultiGpuContext, idx: usize, vals: &[f32]) -> Box<dyn DeviceBuffer> {
        let bytes: Vec<u8> = vals.iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut buf = DirectAllocator.allocate(ctx.device(idx), bytes.len()).unwrap();
        buf.write(&bytes).unwrap();
        buf
    }

    fn f32_vals(buf: &dyn DeviceBuffer) -> Vec<f32> {
        buf.read()
            .unwrap()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    fn streams(ctx: &MultiGpuContext) -> Vec<DeviceStream> {
        ctx.devices.iter().map(|d| d.create_stream().unwrap()).collect()
    }

    #[test]
    fn test_grouped_all_reduce_sum() {
        let ctx = MultiGpuContext::new(&[0, 1]).unwrap();
        let comms = CommGroup::init_all(&ctx).unwrap();
        assert_eq!(comms.world_size(), 2);

        let sends = vec![
            f32_buffer(&ctx, 0, &[1.0, 2.0, 3.0, 4.0]),
            f32_buffer(&ctx, 1, &[5.0, 6.0, 7.0, 8.0]),
        ];
        let mut recvs = vec![f32_buffer(&ctx, 0, &[0.0; 4]), f32_buffer(&ctx, 1, &[0.0; 4])];
        let streams = streams(&ctx);

        comms
            .all_reduce_grouped(&sends, &mut recvs, 4, DType::F32, ReduceOp::Sum, &streams)
            .unwrap();

        for recv in &recvs {
            assert_eq!(f32_vals(recv.as_ref()), vec![6.0, 8.0, 10.0, 12.0]);
        }
        // Inputs untouched
        assert_eq!(f32_vals(sends[0].as_ref()), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_partial_count_leaves_tail() {
        let ctx = MultiGpuContext::new(&[0, 1]).unwrap();
        let comms = CommGroup::init_all(&ctx).unwrap();
        let sends = vec![f32_buffer(&ctx, 0, &[1.0, 1.0, 1.0]), f32_buffer(&ctx, 1, &[2.0, 2.0, 2.0])];
        let mut recvs = vec![f32_buffer(&ctx, 0, &[9.0; 3]), f32_buffer(&ctx, 1, &[9.0; 3])];
        let streams = streams(&ctx);

        comms
            .all_reduce_grouped(&sends, &mut recvs, 2, DType::F32, ReduceOp::Max, &streams)
            .unwrap();
        assert_eq!(f32_vals(recvs[1].as_ref()), vec![2.0, 2.0, 9.0]);
    }

    #[test]
    fn test_missing_rank_is_an_error() {
        let ctx = MultiGpuContext::new(&[0, 1]).unwrap();
        let comms = CommGroup::init_all(&ctx).unwrap();
        let send = f32_buffer(&ctx, 0, &[1.0]);
        let mut recv = f32_buffer(&ctx, 0, &[0.0]);
        let streams = streams(&ctx);

        let mut call = comms.group().unwrap();
        call.all_reduce(0, send.as_ref(), recv.as_mut(), 1, DType::F32, ReduceOp::Sum, &streams[0])
            .unwrap();
        let err = call.end().unwrap_err();
        assert!(err.to_string().contains("did not join"));
    }

    #[test]
    fn test_rank_issued_twice() {
        let ctx = MultiGpuContext::new(&[0, 1]).unwrap();
        let comms = CommGroup::init_all(&ctx).unwrap();
        let send = f32_buffer(&ctx, 0, &[1.0]);
        let mut recv_a = f32_buffer(&ctx, 0, &[0.0]);
        let mut recv_b = f32_buffer(&ctx, 0, &[0.0]);
        let streams = streams(&ctx);

        let mut call = comms.group().unwrap();
        call.all_reduce(0, send.as_ref(), recv_a.as_mut(), 1, DType::F32, ReduceOp::Sum, &streams[0])
            .unwrap();
        let err = call
            .all_reduce(0, send.as_ref(), recv_b.as_mut(), 1, DType::F32, ReduceOp::Sum, &streams[0])
            .unwrap_err();
        assert!(err.to_string().contains("issued twice"));
    }

    #[test]
    fn test_buffer_on_wrong_device() {
        let ctx = MultiGpuContext::new(&[0, 1]).unwrap();
        let comms = CommGroup::init_all(&ctx).unwrap();
        let sends = vec![f32_buffer(&ctx, 1, &[1.0]), f32_buffer(&ctx, 1, &[1.0])];
        let mut recvs = vec![f32_buffer(&ctx, 0, &[0.0]), f32_buffer(&ctx, 1, &[0.0])];
        let streams = streams(&ctx);

        let err = comms
            .all_reduce_grouped(&sends, &mut recvs, 1, DType::F32, ReduceOp::Sum, &streams)
            .unwrap_err();
        assert!(err.to_string().contains("send buffer is on GPU 1"));
    }

    #[test]
    fn test_count_exceeding_buffer() {
        let ctx = MultiGpuContext::new(&[0, 1]).unwrap();
        let comms = CommGroup::init_all(&ctx).unwrap();
        let sends = vec![f32_buffer(&ctx, 0, &[1.0]), f32_buffer(&ctx, 1, &[1.0])];
        let mut recvs = vec![f32_buffer(&ctx, 0, &[0.0]), f32_buffer(&ctx, 1, &[0.0])];
        let streams = streams(&ctx);

        assert!(comms
            .all_reduce_grouped(&sends, &mut recvs, 2, DType::F32, ReduceOp::Sum, &streams)
            .is_err());
    }

    #[test]
    fn test_mismatched_calls_rejected() {
        let ctx = MultiGpuContext::new(&[0, 1]).unwrap();
        let comms = CommGroup::init_all(&ctx).unwrap();
        let s0 = f32_buffer(&ctx, 0, &[1.0, 1.0]);
        let s1 = f32_buffer(&ctx, 1, &[1.0, 1.0]);
        let mut r0 = f32_buffer(&ctx, 0, &[0.0, 0.0]);
        let mut r1 = f32_buffer(&ctx, 1, &[0.0, 0.0]);
        let streams = streams(&ctx);

        let mut call = comms.group().unwrap();
        call.all_reduce(0, s0.as_ref(), r0.as_mut(), 2, DType::F32, ReduceOp::Sum, &streams[0])
            .unwrap();
        call.all_reduce(1, s1.as_ref(), r1.as_mut(), 2, DType::F32, ReduceOp::Max, &streams[1])
            .unwrap();
        assert!(call.end().is_err());
    }

    #[test]
    fn test_single_device_group() {
        let ctx = MultiGpuContext::new(&[3]).unwrap();
        let comms = CommGroup::init_all(&ctx).unwrap();
        assert_eq!(comms.rank_device(0), Some(3));
        let sends = vec![f32_buffer(&ctx, 0, &[4.0, 5.0])];
        let mut recvs = vec![f32_buffer(&ctx, 0, &[0.0, 0.0])];
        let streams = streams(&ctx);

        comms
            .all_reduce_grouped(&sends, &mut recvs, 2, DType::F32, ReduceOp::Avg, &streams)
            .unwrap();
        assert_eq!(f32_vals(recvs[0].as_ref()), vec![4.0, 5.0]);
    }
}
