/// Panic in debug builds (the backtrace is what we want), log a warning in
/// release builds.
#[macro_export]
macro_rules! debug_panic {
    ($($x:tt)+) => {
        if cfg!(debug_assertions) {
            panic!($($x)+);
        } else {
            log::warn!($($x)+);
        }
    };
}
