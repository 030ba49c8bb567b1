mod error;
mod types;

pub use types::*;

use std::ffi::CString;
use std::os::raw::c_char;
use std::slice;

use tsm_engine::{EngineConfig, EngineError, Offload, TileGeometry, ELEMENT_SIZE};

/// Execute a closure that returns a `TsmStatus`, catching any panics
/// and converting them into `TsmStatus::ErrorInternal`.
fn catch_panic<F: FnOnce() -> TsmStatus + std::panic::UnwindSafe>(f: F) -> TsmStatus {
    match std::panic::catch_unwind(f) {
        Ok(status) => status,
        Err(_) => error::record(TsmStatus::ErrorInternal, "internal panic"),
    }
}

fn report(err: EngineError) -> TsmStatus {
    error::record(TsmStatus::from(&err), err.to_string())
}

fn invalid(msg: &str) -> TsmStatus {
    error::record(TsmStatus::ErrorInvalidArgument, msg)
}

/// Element counts of A (and B) and C for the given dimensions.
fn operand_lens(width: usize, height: usize) -> Option<(usize, usize)> {
    Some((width.checked_mul(height)?, height.checked_mul(height)?))
}

/// Fill `*config` with the engine defaults.
#[no_mangle]
pub unsafe extern "C" fn tsm_default_config(config: *mut TsmConfig) -> TsmStatus {
    if config.is_null() {
        return invalid("config is null");
    }
    *config = TsmConfig::default();
    TsmStatus::Ok
}

/// Plan the stripe layout for an `n x n` multiply.
///
/// `scratchpad_bytes` of zero selects the default scratchpad. On success the
/// layout is written to `*out`; its `height` may be smaller than `n`.
#[no_mangle]
pub unsafe extern "C" fn tsm_plan_geometry(
    n: usize,
    scratchpad_bytes: usize,
    out: *mut TsmGeometry,
) -> TsmStatus {
    catch_panic(|| {
        if out.is_null() {
            return invalid("out is null");
        }
        let mut config = EngineConfig::default();
        if scratchpad_bytes > 0 {
            config = config.with_scratchpad_bytes(scratchpad_bytes);
        }
        match TileGeometry::plan(n, ELEMENT_SIZE, config.stripe_budget, config.min_stripe_height) {
            Ok(g) => {
                unsafe { *out = TsmGeometry::from(&g) };
                TsmStatus::Ok
            }
            Err(e) => report(e),
        }
    })
}

/// Compute `C = A @ B` through the tile pipeline with the default config.
///
/// A is `height x width`, B is `width x height` and C is `height x height`,
/// all row-major `u32`. C is only written when the run succeeds.
#[no_mangle]
pub unsafe extern "C" fn tsm_run_tiled_matmul(
    a: *const u32,
    b: *const u32,
    c: *mut u32,
    width: usize,
    height: usize,
    stripe_height: usize,
) -> TsmStatus {
    let config = TsmConfig::default();
    tsm_run_offload(
        TsmMode::Tiled,
        &config,
        a,
        b,
        c,
        width,
        height,
        stripe_height,
    )
}

/// Run one offload in the given mode.
///
/// `config` may be null for the defaults. `stripe_height` is ignored in
/// resident and direct SVM modes.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn tsm_run_offload(
    mode: TsmMode,
    config: *const TsmConfig,
    a: *const u32,
    b: *const u32,
    c: *mut u32,
    width: usize,
    height: usize,
    stripe_height: usize,
) -> TsmStatus {
    catch_panic(|| {
        if a.is_null() || b.is_null() || c.is_null() {
            return invalid("null matrix pointer");
        }
        let Some((operand_len, result_len)) = operand_lens(width, height) else {
            return invalid("matrix dimensions overflow");
        };
        let config = match unsafe { config.as_ref() } {
            Some(c) => EngineConfig::from(c),
            None => EngineConfig::default(),
        };
        let offload = match Offload::new(config) {
            Ok(o) => o,
            Err(e) => return report(e),
        };

        let (a, b, c) = unsafe {
            (
                slice::from_raw_parts(a, operand_len),
                slice::from_raw_parts(b, operand_len),
                slice::from_raw_parts_mut(c, result_len),
            )
        };
        let outcome = match mode {
            TsmMode::Tiled => offload
                .run_tiled_matmul(a, b, c, width, height, stripe_height)
                .map(|_| ()),
            TsmMode::Resident => offload.run_resident(a, b, c, width, height).map(|_| ()),
            TsmMode::Svm => offload
                .run_svm(a, b, c, width, height, stripe_height)
                .map(|_| ()),
            TsmMode::SvmDirect => offload
                .run_svm_direct(a, b, c, width, height)
                .map(|_| ()),
        };
        match outcome {
            Ok(()) => TsmStatus::Ok,
            Err(e) => report(e),
        }
    })
}

/// Retrieve the last error message.
///
/// Returns a pointer to a C string describing the most recent error on this
/// thread, or null if there is none. The caller must free the returned
/// string with `tsm_free_string`.
#[no_mangle]
pub extern "C" fn tsm_last_error() -> *const c_char {
    match error::take_message() {
        Some(e) => e.into_raw(),
        None => std::ptr::null(),
    }
}

/// Status of the most recent failure on this thread.
///
/// Returns `TSM_STATUS_OK` when no failure is recorded. The record is kept
/// until `tsm_last_error` takes it.
#[no_mangle]
pub extern "C" fn tsm_last_status() -> TsmStatus {
    error::last_status()
}

/// Free a string previously returned by `tsm_last_error`.
#[no_mangle]
pub unsafe extern "C" fn tsm_free_string(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;
    use std::ptr;
    use tsm_tensor::{CpuBackend, MatmulBackend};

    fn last_error() -> Option<String> {
        let p = tsm_last_error();
        if p.is_null() {
            return None;
        }
        let msg = unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned();
        unsafe { tsm_free_string(p as *mut c_char) };
        Some(msg)
    }

    #[test]
    fn test_run_tiled_matmul() {
        let n = 16;
        let a: Vec<u32> = (0..(n * n) as u32).collect();
        let b: Vec<u32> = (0..(n * n) as u32).map(|v| v % 5).collect();
        let mut c = vec![0u32; n * n];
        let status =
            unsafe { tsm_run_tiled_matmul(a.as_ptr(), b.as_ptr(), c.as_mut_ptr(), n, n, 4) };
        assert_eq!(status, TsmStatus::Ok);
        assert_eq!(c, CpuBackend::new().matmul(&a, &b, n, n, n).unwrap());
    }

    #[test]
    fn test_run_offload_modes() {
        let n = 8;
        let a: Vec<u32> = (0..(n * n) as u32).map(|v| v * 3).collect();
        let b: Vec<u32> = (0..(n * n) as u32).map(|v| v % 7).collect();
        let expected = CpuBackend::new().matmul(&a, &b, n, n, n).unwrap();
        let mut config = TsmConfig::default();
        config.compute_workers = 2;

        for mode in [
            TsmMode::Tiled,
            TsmMode::Resident,
            TsmMode::Svm,
            TsmMode::SvmDirect,
        ] {
            let mut c = vec![0u32; n * n];
            let status = unsafe {
                tsm_run_offload(mode, &config, a.as_ptr(), b.as_ptr(), c.as_mut_ptr(), n, n, 2)
            };
            assert_eq!(status, TsmStatus::Ok, "{mode:?}");
            assert_eq!(c, expected, "{mode:?}");
        }
    }

    #[test]
    fn test_null_pointer_rejected() {
        let mut c = vec![0u32; 4];
        let status = unsafe { tsm_run_tiled_matmul(ptr::null(), ptr::null(), c.as_mut_ptr(), 2, 2, 1) };
        assert_eq!(status, TsmStatus::ErrorInvalidArgument);
        assert_eq!(last_error().as_deref(), Some("null matrix pointer"));
        assert_eq!(last_error(), None);
    }

    #[test]
    fn test_out_of_local_memory_status() {
        let n = 16;
        let a = vec![1u32; n * n];
        let mut c = vec![9u32; n * n];
        let config = TsmConfig {
            scratchpad_bytes: 256,
            compute_workers: 1,
            b_transposed: false,
        };
        let status = unsafe {
            tsm_run_offload(TsmMode::Tiled, &config, a.as_ptr(), a.as_ptr(), c.as_mut_ptr(), n, n, 8)
        };
        assert_eq!(status, TsmStatus::ErrorOutOfLocalMemory);
        assert!(last_error().unwrap().contains("out of local memory"));
        assert!(c.iter().all(|&v| v == 9));
    }

    #[test]
    fn test_last_status_follows_last_error() {
        assert_eq!(unsafe { tsm_default_config(ptr::null_mut()) }, TsmStatus::ErrorInvalidArgument);
        assert_eq!(tsm_last_status(), TsmStatus::ErrorInvalidArgument);
        assert_eq!(tsm_last_status(), TsmStatus::ErrorInvalidArgument);
        assert_eq!(last_error().as_deref(), Some("config is null"));
        assert_eq!(tsm_last_status(), TsmStatus::Ok);
    }

    #[test]
    fn test_message_with_nul_is_kept() {
        let status = error::record(TsmStatus::ErrorTransfer, "bad\0 copy");
        assert_eq!(status, TsmStatus::ErrorTransfer);
        assert_eq!(last_error().as_deref(), Some("bad copy"));
    }

    #[test]
    fn test_plan_geometry() {
        let mut g = TsmGeometry::default();
        let status = unsafe { tsm_plan_geometry(128, 128 * 1024, &mut g) };
        assert_eq!(status, TsmStatus::Ok);
        assert_eq!(
            g,
            TsmGeometry {
                width: 128,
                height: 128,
                stripe_height: 32,
                n_stripes: 4
            }
        );

        let status = unsafe { tsm_plan_geometry(256, 1024, &mut g) };
        assert_eq!(status, TsmStatus::ErrorCapacity);
        assert!(last_error().is_some());
    }

    #[test]
    fn test_default_config() {
        let mut config = TsmConfig {
            scratchpad_bytes: 0,
            compute_workers: 0,
            b_transposed: true,
        };
        assert_eq!(unsafe { tsm_default_config(&mut config) }, TsmStatus::Ok);
        assert_eq!(config.scratchpad_bytes, 256 * 1024);
        assert!(!config.b_transposed);
    }
}
