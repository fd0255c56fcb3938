/// Level-dispatching wrapper around [`Context::try_log`]: the first argument
/// is the context, the second a slog level macro name (`info`, `debug`,
/// `warn`, `error`).
///
/// ```ignore
/// try_log!(ctx, warn, "Unable to scan block #{}: {}", height, e);
/// ```
#[macro_export]
macro_rules! try_log {
    ($ctx:expr, $level:ident, $tag:expr, $($args:tt)*) => {
        $ctx.try_log(|l| $level!(l, $tag, $($args)*));
    };
    ($ctx:expr, $level:ident, $tag:expr) => {
        $ctx.try_log(|l| $level!(l, $tag));
    };
}
