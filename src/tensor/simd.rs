//! Architecture-dispatched inner-loop primitives.
//!
//! `dot` and `axpy` carry the bulk of every matmul, linear, attention and
//! convolution in the core. On x86-64 both AVX2 and FMA must be present
//! for the wide path; on aarch64 NEON is baseline. Everything else takes
//! the unrolled scalar fallback.

#[cfg(target_arch = "x86_64")]
use std::sync::OnceLock;

#[cfg(target_arch = "x86_64")]
fn has_avx2_fma() -> bool {
    static PROBE: OnceLock<bool> = OnceLock::new();
    *PROBE.get_or_init(|| {
        is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma")
    })
}

/// Dot product of two equal-length slices.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    dot_impl(a, b)
}

/// `dst[i] += alpha * src[i]` over equal-length slices.
#[inline]
pub fn axpy(dst: &mut [f32], alpha: f32, src: &[f32]) {
    debug_assert_eq!(dst.len(), src.len());
    axpy_impl(dst, alpha, src)
}

#[cfg(target_arch = "x86_64")]
#[inline]
fn dot_impl(a: &[f32], b: &[f32]) -> f32 {
    if has_avx2_fma() {
        unsafe { dot_avx2(a, b) }
    } else {
        dot_scalar(a, b)
    }
}

#[cfg(target_arch = "x86_64")]
#[inline]
fn axpy_impl(dst: &mut [f32], alpha: f32, src: &[f32]) {
    if has_avx2_fma() {
        unsafe { axpy_avx2(dst, alpha, src) }
    } else {
        axpy_scalar(dst, alpha, src)
    }
}

#[cfg(target_arch = "aarch64")]
#[inline]
fn dot_impl(a: &[f32], b: &[f32]) -> f32 {
    unsafe { dot_neon(a, b) }
}

#[cfg(target_arch = "aarch64")]
#[inline]
fn axpy_impl(dst: &mut [f32], alpha: f32, src: &[f32]) {
    unsafe { axpy_neon(dst, alpha, src) }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline]
fn dot_impl(a: &[f32], b: &[f32]) -> f32 {
    dot_scalar(a, b)
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline]
fn axpy_impl(dst: &mut [f32], alpha: f32, src: &[f32]) {
    axpy_scalar(dst, alpha, src)
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn dot_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let n = a.len();
    let mut acc0 = _mm256_setzero_ps();
    let mut acc1 = _mm256_setzero_ps();
    let mut acc2 = _mm256_setzero_ps();
    let mut acc3 = _mm256_setzero_ps();

    let pa = a.as_ptr();
    let pb = b.as_ptr();
    let mut i = 0;
    while i + 32 <= n {
        acc0 = _mm256_fmadd_ps(_mm256_loadu_ps(pa.add(i)), _mm256_loadu_ps(pb.add(i)), acc0);
        acc1 = _mm256_fmadd_ps(
            _mm256_loadu_ps(pa.add(i + 8)),
            _mm256_loadu_ps(pb.add(i + 8)),
            acc1,
        );
        acc2 = _mm256_fmadd_ps(
            _mm256_loadu_ps(pa.add(i + 16)),
            _mm256_loadu_ps(pb.add(i + 16)),
            acc2,
        );
        acc3 = _mm256_fmadd_ps(
            _mm256_loadu_ps(pa.add(i + 24)),
            _mm256_loadu_ps(pb.add(i + 24)),
            acc3,
        );
        i += 32;
    }
    while i + 8 <= n {
        acc0 = _mm256_fmadd_ps(_mm256_loadu_ps(pa.add(i)), _mm256_loadu_ps(pb.add(i)), acc0);
        i += 8;
    }

    let acc = _mm256_add_ps(_mm256_add_ps(acc0, acc1), _mm256_add_ps(acc2, acc3));
    let mut lanes = [0.0f32; 8];
    _mm256_storeu_ps(lanes.as_mut_ptr(), acc);
    let mut sum: f32 = lanes.iter().sum();

    while i < n {
        sum += *pa.add(i) * *pb.add(i);
        i += 1;
    }
    sum
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn axpy_avx2(dst: &mut [f32], alpha: f32, src: &[f32]) {
    use std::arch::x86_64::*;

    let n = dst.len();
    let va = _mm256_set1_ps(alpha);
    let pd = dst.as_mut_ptr();
    let ps = src.as_ptr();
    let mut i = 0;
    while i + 8 <= n {
        let d = _mm256_loadu_ps(pd.add(i));
        let s = _mm256_loadu_ps(ps.add(i));
        _mm256_storeu_ps(pd.add(i), _mm256_fmadd_ps(va, s, d));
        i += 8;
    }
    while i < n {
        *pd.add(i) += alpha * *ps.add(i);
        i += 1;
    }
}

#[cfg(target_arch = "aarch64")]
unsafe fn dot_neon(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::aarch64::*;

    let n = a.len();
    let mut acc0 = vdupq_n_f32(0.0);
    let mut acc1 = vdupq_n_f32(0.0);
    let mut acc2 = vdupq_n_f32(0.0);
    let mut acc3 = vdupq_n_f32(0.0);

    let pa = a.as_ptr();
    let pb = b.as_ptr();
    let mut i = 0;
    while i + 16 <= n {
        acc0 = vfmaq_f32(acc0, vld1q_f32(pa.add(i)), vld1q_f32(pb.add(i)));
        acc1 = vfmaq_f32(acc1, vld1q_f32(pa.add(i + 4)), vld1q_f32(pb.add(i + 4)));
        acc2 = vfmaq_f32(acc2, vld1q_f32(pa.add(i + 8)), vld1q_f32(pb.add(i + 8)));
        acc3 = vfmaq_f32(acc3, vld1q_f32(pa.add(i + 12)), vld1q_f32(pb.add(i + 12)));
        i += 16;
    }
    while i + 4 <= n {
        acc0 = vfmaq_f32(acc0, vld1q_f32(pa.add(i)), vld1q_f32(pb.add(i)));
        i += 4;
    }

    // Tail goes into a separate scalar accumulator; writing lanes of an
    // accumulator register would discard the other lanes.
    let mut tail = 0.0f32;
    while i < n {
        tail += *pa.add(i) * *pb.add(i);
        i += 1;
    }

    let acc = vaddq_f32(vaddq_f32(acc0, acc1), vaddq_f32(acc2, acc3));
    vaddvq_f32(acc) + tail
}

#[cfg(target_arch = "aarch64")]
unsafe fn axpy_neon(dst: &mut [f32], alpha: f32, src: &[f32]) {
    use std::arch::aarch64::*;

    let n = dst.len();
    let va = vdupq_n_f32(alpha);
    let pd = dst.as_mut_ptr();
    let ps = src.as_ptr();
    let mut i = 0;
    while i + 4 <= n {
        let d = vld1q_f32(pd.add(i));
        let s = vld1q_f32(ps.add(i));
        vst1q_f32(pd.add(i), vfmaq_f32(d, va, s));
        i += 4;
    }
    while i < n {
        *pd.add(i) += alpha * *ps.add(i);
        i += 1;
    }
}

#[cfg_attr(target_arch = "aarch64", allow(dead_code))]
fn dot_scalar(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len();
    let chunks = n / 8;
    let (mut s0, mut s1, mut s2, mut s3) = (0.0f32, 0.0f32, 0.0f32, 0.0f32);
    let (mut s4, mut s5, mut s6, mut s7) = (0.0f32, 0.0f32, 0.0f32, 0.0f32);
    for c in 0..chunks {
        let i = c * 8;
        s0 += a[i] * b[i];
        s1 += a[i + 1] * b[i + 1];
        s2 += a[i + 2] * b[i + 2];
        s3 += a[i + 3] * b[i + 3];
        s4 += a[i + 4] * b[i + 4];
        s5 += a[i + 5] * b[i + 5];
        s6 += a[i + 6] * b[i + 6];
        s7 += a[i + 7] * b[i + 7];
    }
    let mut sum = ((s0 + s1) + (s2 + s3)) + ((s4 + s5) + (s6 + s7));
    for i in chunks * 8..n {
        sum += a[i] * b[i];
    }
    sum
}

#[cfg_attr(target_arch = "aarch64", allow(dead_code))]
fn axpy_scalar(dst: &mut [f32], alpha: f32, src: &[f32]) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d += alpha * *s;
    }
}
