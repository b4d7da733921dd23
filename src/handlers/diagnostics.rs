use crate::{auth::{principals, Identity}, models::{DiagnosticsResponse, ErrorResponse}, AppState};
use axum::{extract::{State, Extension}, http::StatusCode, Json};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::{Mutex, OnceLock};
use sysinfo::System;
use tracing::info;

static SYSTEM_MONITOR: OnceLock<Mutex<System>> = OnceLock::new();

/// Report room, session and persistence counters plus host load
pub async fn diagnostics(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<(StatusCode, Json<DiagnosticsResponse>), (StatusCode, Json<ErrorResponse>)> {

    // Only cloud admins may look
    principals::ensure_cloud_admin(&identity)?;

    // Aggregate counters from every running coordinator
    let mut n_rooms: u32 = 0;
    let mut n_sessions: u32 = 0;
    let mut n_applied_updates: u64 = 0;
    let mut n_persist_failures: u64 = 0;
    for handle in state.rooms.handles() {
        let stats = handle.stats();
        n_rooms += 1;
        n_sessions += stats.sessions.load(Ordering::Relaxed) as u32;
        n_applied_updates += stats.applied_updates.load(Ordering::Relaxed);
        n_persist_failures += stats.persist_failures.load(Ordering::Relaxed);
    }

    // System stats
    let (cpu_usage, memory_alloc, memory_free, memory_total) = {
        let sys_lock = SYSTEM_MONITOR.get_or_init(|| {
            Mutex::new(System::new_all())
        });
        match sys_lock.lock() {
            Ok(mut sys) => {
                sys.refresh_cpu();
                sys.refresh_memory();
                (
                    sys.global_cpu_info().cpu_usage(),
                    sys.used_memory(),
                    sys.free_memory(),
                    sys.total_memory(),
                )
            }
            Err(_) => (0.0, 0, 0, 0)
        }
    };

    info!(
        "Diagnostics: CPU: {:.2}%, Mem: {}/{} MB, Rooms: {}, Sessions: {}, Persist failures: {}",
        cpu_usage,
        memory_alloc / 1024 / 1024,
        memory_total / 1024 / 1024,
        n_rooms,
        n_sessions,
        n_persist_failures
    );

    Ok((
        StatusCode::OK,
        Json(DiagnosticsResponse {
            n_rooms,
            n_sessions,
            n_applied_updates,
            n_persist_failures,
            cpu_usage,
            memory_alloc,
            memory_total,
            memory_free,
        }),
    ))
}
