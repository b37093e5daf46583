//! Process-wide worker configuration and the job scheduler kernels use
//! for row / channel parallelism.
//!
//! Two independent knobs: tensor workers drive matmul, linear and the
//! fused attention path; conv workers drive convolution output-channel
//! fan-out. Both default to 1 (sequential). Changing a knob is safe at
//! any time and takes effect on the next kernel call.

use std::sync::atomic::{AtomicUsize, Ordering};

static TENSOR_WORKERS: AtomicUsize = AtomicUsize::new(1);
static CONV_WORKERS: AtomicUsize = AtomicUsize::new(1);

/// Worker count for matmul / linear / attention jobs. Values <= 1 mean
/// sequential execution.
pub fn set_tensor_workers(n: usize) {
    TENSOR_WORKERS.store(n.max(1), Ordering::Relaxed);
}

pub fn tensor_workers() -> usize {
    TENSOR_WORKERS.load(Ordering::Relaxed)
}

/// Worker count for Conv1d / ConvTranspose1d output-channel jobs.
pub fn set_conv_workers(n: usize) {
    CONV_WORKERS.store(n.max(1), Ordering::Relaxed);
}

pub fn conv_workers() -> usize {
    CONV_WORKERS.load(Ordering::Relaxed)
}

/// Runs `jobs` independent jobs on up to `workers` threads.
///
/// Jobs must write to disjoint output slices; each job's internal
/// reduction is strictly ordered, so results do not depend on the worker
/// count. Blocks until every job has completed. With `workers <= 1` or a
/// single job, everything runs on the calling thread and nothing is
/// spawned.
pub(crate) fn run_jobs<F>(workers: usize, jobs: usize, job: F)
where
    F: Fn(usize) + Sync,
{
    if jobs == 0 {
        return;
    }
    if workers <= 1 || jobs == 1 {
        for j in 0..jobs {
            job(j);
        }
        return;
    }

    let next = AtomicUsize::new(0);
    let threads = workers.min(jobs);
    std::thread::scope(|scope| {
        for _ in 1..threads {
            scope.spawn(|| loop {
                let j = next.fetch_add(1, Ordering::Relaxed);
                if j >= jobs {
                    break;
                }
                job(j);
            });
        }
        // The calling thread pulls from the same queue.
        loop {
            let j = next.fetch_add(1, Ordering::Relaxed);
            if j >= jobs {
                break;
            }
            job(j);
        }
    });
}

/// Shareable raw pointer for job closures that write disjoint slices of
/// one output buffer. The caller guarantees disjointness.
#[derive(Clone, Copy)]
pub(crate) struct SendPtr(pub *mut f32);

unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

impl SendPtr {
    /// # Safety
    /// `offset + len` must stay inside the allocation and no two
    /// concurrent jobs may receive overlapping ranges.
    pub(crate) unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [f32] {
        std::slice::from_raw_parts_mut(self.0.add(offset), len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn knobs_round_trip_and_clamp() {
        set_tensor_workers(4);
        assert_eq!(tensor_workers(), 4);
        set_tensor_workers(0);
        assert_eq!(tensor_workers(), 1);
        set_tensor_workers(1);

        set_conv_workers(3);
        assert_eq!(conv_workers(), 3);
        set_conv_workers(1);
    }

    #[test]
    fn run_jobs_covers_every_job_exactly_once() {
        let hits: Vec<AtomicUsize> = (0..257).map(|_| AtomicUsize::new(0)).collect();
        run_jobs(4, hits.len(), |j| {
            hits[j].fetch_add(1, Ordering::Relaxed);
        });
        assert!(hits.iter().all(|h| h.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn single_worker_writes_disjoint_slices_in_order() {
        let mut out = vec![0.0f32; 8];
        let ptr = SendPtr(out.as_mut_ptr());
        run_jobs(1, 8, |j| {
            let slot = unsafe { ptr.slice_mut(j, 1) };
            slot[0] = j as f32;
        });
        assert_eq!(out, (0..8).map(|v| v as f32).collect::<Vec<_>>());
    }
}
