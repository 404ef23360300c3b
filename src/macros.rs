//! Replay-safe logging macros for coordination functions.
//!
//! A coordination function is re-run from the start when its instance is
//! rebuilt from history, so a plain `tracing::info!` inside it would print again
//! for every step already taken. These macros stay silent while the context is
//! reproducing recorded history and tag every record with the workflow identity.

/// Log at INFO level from inside a coordination function
///
/// # Examples
///
/// ```ignore
/// use storage_workflows::workflow_info;
///
/// workflow_info!(ctx, svm_name = %input.name, "Starting SVM creation");
/// ```
#[macro_export]
macro_rules! workflow_info {
    ($ctx:expr, $($arg:tt)+) => {
        if !$ctx.is_replaying() {
            ::tracing::info!(
                workflow_id = %$ctx.workflow_id(),
                workflow_type = %$ctx.workflow_type(),
                $($arg)+
            );
        }
    };
}

/// Log at WARN level from inside a coordination function
#[macro_export]
macro_rules! workflow_warn {
    ($ctx:expr, $($arg:tt)+) => {
        if !$ctx.is_replaying() {
            ::tracing::warn!(
                workflow_id = %$ctx.workflow_id(),
                workflow_type = %$ctx.workflow_type(),
                $($arg)+
            );
        }
    };
}

/// Log at ERROR level from inside a coordination function
///
/// # Examples
///
/// ```ignore
/// use storage_workflows::workflow_error;
///
/// if let Err(e) = outcome {
///     workflow_error!(ctx, error = %e, "Error in monitoring loop");
/// }
/// ```
#[macro_export]
macro_rules! workflow_error {
    ($ctx:expr, $($arg:tt)+) => {
        if !$ctx.is_replaying() {
            ::tracing::error!(
                workflow_id = %$ctx.workflow_id(),
                workflow_type = %$ctx.workflow_type(),
                $($arg)+
            );
        }
    };
}
