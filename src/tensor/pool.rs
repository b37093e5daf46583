//! Size-class pool of f32 scratch buffers.
//!
//! im2col patch matrices and transposed-conv repacks need multi-megabyte
//! scratch per call; recycling them through a small set of power-of-two
//! classes keeps the steady-state allocation rate near zero. Buffers are
//! handed out as exact-length zeroed views and returned on drop, so every
//! exit path (including errors) releases its scratch.

use std::ops::{Deref, DerefMut};
use std::sync::Mutex;
use std::sync::OnceLock;

/// Smallest pooled request: one past 2^10 floats.
const MIN_POOLED: usize = 1024;
const NUM_CLASSES: usize = 17;

fn buckets() -> &'static [Mutex<Vec<Vec<f32>>>; NUM_CLASSES] {
    static BUCKETS: OnceLock<[Mutex<Vec<Vec<f32>>>; NUM_CLASSES]> = OnceLock::new();
    BUCKETS.get_or_init(|| std::array::from_fn(|_| Mutex::new(Vec::new())))
}

/// `ceil(log2 n) - 10`, valid for `n > MIN_POOLED`.
fn class_of(n: usize) -> Option<usize> {
    if n <= MIN_POOLED {
        return None;
    }
    // bit length of (n - 1) == ceil(log2 n) for n > 1.
    let class = (usize::BITS - (n - 1).leading_zeros()) as usize - 10;
    if class >= NUM_CLASSES {
        None
    } else {
        Some(class)
    }
}

/// Every n in a class fits in `2^(class + 10)` floats.
fn class_capacity(class: usize) -> usize {
    1usize << (class + 10)
}

/// RAII view over a pooled (or, for out-of-range sizes, one-shot)
/// allocation. Dereferences to exactly the requested number of zeroed
/// floats.
pub struct Scratch {
    buf: Vec<f32>,
    len: usize,
    class: Option<usize>,
}

impl Scratch {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for Scratch {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.buf[..self.len]
    }
}

impl DerefMut for Scratch {
    fn deref_mut(&mut self) -> &mut [f32] {
        &mut self.buf[..self.len]
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if let Some(class) = self.class {
            let buf = std::mem::take(&mut self.buf);
            buckets()[class].lock().unwrap().push(buf);
        }
    }
}

/// Returns a zeroed scratch view of exactly `n` floats, recycling a
/// pooled allocation when one of the right class is available.
pub fn get_scratch(n: usize) -> Scratch {
    let class = class_of(n);
    let buf = match class {
        Some(c) => {
            let recycled = buckets()[c].lock().unwrap().pop();
            match recycled {
                Some(mut buf) => {
                    buf[..n].fill(0.0);
                    buf
                }
                None => vec![0.0; class_capacity(c)],
            }
        }
        None => vec![0.0; n],
    };
    Scratch { buf, len: n, class }
}
