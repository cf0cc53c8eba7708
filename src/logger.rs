use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn setup_logging(default_level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_file(true)
                .compact(),
        )
        .with(env_filter)
        .init();

    Ok(())
}

/// Structured logging for a subsystem-boundary operation (registry/health/rotation/scheduler).
#[macro_export]
macro_rules! log_mobile_operation {
    ($level:ident, $mobile:expr, $correlation_id:expr, $operation:expr) => {{
        tracing::$level!(
            mobile = %$mobile,
            correlation_id = %$correlation_id,
            operation = $operation,
        );
    }};
    ($level:ident, $mobile:expr, $correlation_id:expr, $operation:expr, $($key:ident = $value:expr),* $(,)?) => {{
        tracing::$level!(
            mobile = %$mobile,
            correlation_id = %$correlation_id,
            operation = $operation,
            $($key = $value,)*
        );
    }};
}

#[macro_export]
macro_rules! log_send_success {
    ($mobile:expr, $channel:expr, $correlation_id:expr) => {{
        tracing::info!(
            mobile = %$mobile,
            channel = %$channel,
            correlation_id = %$correlation_id,
            success = true,
            "promotion send completed"
        );
    }};
    ($mobile:expr, $channel:expr, $correlation_id:expr, $($key:ident = $value:expr),* $(,)?) => {{
        tracing::info!(
            mobile = %$mobile,
            channel = %$channel,
            correlation_id = %$correlation_id,
            success = true,
            $($key = $value,)*
            "promotion send completed"
        );
    }};
}

#[macro_export]
macro_rules! log_send_failure {
    ($mobile:expr, $channel:expr, $correlation_id:expr, $error:expr) => {{
        tracing::warn!(
            mobile = %$mobile,
            channel = %$channel,
            correlation_id = %$correlation_id,
            error = %$error,
            success = false,
            "promotion send failed"
        );
    }};
    ($mobile:expr, $channel:expr, $correlation_id:expr, $error:expr, $($key:ident = $value:expr),* $(,)?) => {{
        tracing::warn!(
            mobile = %$mobile,
            channel = %$channel,
            correlation_id = %$correlation_id,
            error = %$error,
            success = false,
            $($key = $value,)*
            "promotion send failed"
        );
    }};
}

#[macro_export]
macro_rules! log_rotation_event {
    ($added:expr, $removed:expr, $correlation_id:expr) => {
        tracing::info!(
            added = ?$added,
            removed = ?$removed,
            correlation_id = %$correlation_id,
            event_type = "rotation",
            "active mobile set rotated"
        );
    };
}
