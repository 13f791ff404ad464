//! Structured per-PG logging (spec §9 ambient stack). Every PG-scoped log
//! line is prefixed with its id and epoch, the way the teacher's
//! `WorkerTask::log`/`task_log!` prefixes a running task's output with its
//! worker id; this crate has no long-lived `WorkerTask` type, so `pg_log!`
//! builds directly on the `log` facade instead.

/// Logs one line at `info` level tagged with a PG's id and epoch.
#[macro_export]
macro_rules! pg_log {
    ($pg:expr, $epoch:expr, $($arg:tt)+) => {
        log::info!("pg {} (epoch {}): {}", $pg, $epoch, format_args!($($arg)+));
    };
}

/// Same, at `warn` level, for degraded/retry conditions.
#[macro_export]
macro_rules! pg_log_warn {
    ($pg:expr, $epoch:expr, $($arg:tt)+) => {
        log::warn!("pg {} (epoch {}): {}", $pg, $epoch, format_args!($($arg)+));
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn pg_log_macros_compile_and_run_without_panicking() {
        let _ = env_logger::builder().is_test(true).try_init();
        pg_log!(crate::types::PgId::new(1, 0), 5u64, "peering advanced");
        pg_log_warn!(crate::types::PgId::new(1, 0), 5u64, "peer {} unreachable", 7);
    }
}
