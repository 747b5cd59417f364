use std::sync::OnceLock;

use crate::env_config::{define_env_flag, env_var_positive_u64};

/// Upper bound on rayon workers used for tile hashing.
pub(crate) const REFINE_PARALLEL_MAX_WORKERS: usize = 8;

/// 1920x1080 is 60x34 tiles; smaller outputs hash faster than the pool
/// handoff costs.
const REFINE_PARALLEL_MIN_TILES_DEFAULT: usize = 1024;

/// Each worker should get at least this many tile rows.
const REFINE_PARALLEL_MIN_ROWS_PER_WORKER: usize = 4;

define_env_flag!(enabled_unless(
    parallel_refine_enabled,
    "DAMAGE_CAPTURE_DISABLE_PARALLEL_REFINE"
));

fn parallel_refine_min_tiles() -> usize {
    static VALUE: OnceLock<usize> = OnceLock::new();
    *VALUE.get_or_init(|| {
        env_var_positive_u64("DAMAGE_CAPTURE_PARALLEL_REFINE_MIN_TILES")
            .and_then(|value| usize::try_from(value).ok())
            .unwrap_or(REFINE_PARALLEL_MIN_TILES_DEFAULT)
    })
}

#[inline]
pub(crate) fn refine_workers(max_workers: usize) -> usize {
    static WORKERS: OnceLock<usize> = OnceLock::new();
    (*WORKERS.get_or_init(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }))
    .min(max_workers.max(1))
}

#[inline]
pub(crate) fn should_parallelize_refine(tile_rows: usize, tiles_per_row: usize) -> bool {
    if !parallel_refine_enabled() {
        return false;
    }
    let workers = refine_workers(REFINE_PARALLEL_MAX_WORKERS);
    if workers <= 1 {
        return false;
    }
    let tile_count = tile_rows.saturating_mul(tiles_per_row);
    tile_count >= parallel_refine_min_tiles()
        && tile_rows >= REFINE_PARALLEL_MIN_ROWS_PER_WORKER.saturating_mul(2)
}

/// Run `job` inside the shared refine pool, or inline when no pool could
/// be built.
#[inline]
pub(crate) fn install_refine_pool<F>(job: F)
where
    F: FnOnce() + Send,
{
    static POOL: OnceLock<Option<rayon::ThreadPool>> = OnceLock::new();
    if let Some(pool) = POOL
        .get_or_init(|| {
            let workers = refine_workers(REFINE_PARALLEL_MAX_WORKERS);
            if workers <= 1 {
                return None;
            }
            rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|index| format!("damage-refine-{index}"))
                .build()
                .ok()
        })
        .as_ref()
    {
        pool.install(job);
    } else {
        job();
    }
}

/// Pre-build the refine pool so the first large refine doesn't pay the
/// pool creation cost.
pub fn warmup() {
    install_refine_pool(|| {});
}
