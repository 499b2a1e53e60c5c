#![allow(unused_macros)]

/// Helper macro for locking items
///
/// ```rust, ignore
///  let mut data = lock!(my_mutex);
///  data.some_field = 42;
/// ```
macro_rules! lock {
    ($lock:expr) => {
        $lock.lock().expect("Failed to acquire lock")
    };
}

/// Helper macro for reading locked items
///
/// ```rust, ignore
///  let data = read_lock!(my_arc_rwlock);
///  println!("{}", data.some_field);
/// ```
macro_rules! read_lock {
    ($arc_rwlock:expr) => {
        $arc_rwlock.read().expect("Failed to acquire read lock")
    };
}

/// Helper macro for writing to locked items
///
/// ```rust, ignore
///  let mut data = write_lock!(my_arc_rwlock);
///  data.some_field = 42;
/// ```
macro_rules! write_lock {
    ($arc_rwlock:expr) => {
        $arc_rwlock.write().expect("Failed to acquire write lock")
    };
}

/// Aborts the current operation because an internal invariant of the loader was broken.
///
/// These are bugs in the loader itself, not in a mod. Continuing would risk corrupting the
/// loaded-code graph, so the macro logs and panics.
///
/// ```rust, ignore
///  invariant_violation!("resolution stack underflow in {}", ctx);
/// ```
macro_rules! invariant_violation {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        log::error!(target: "dotmod::invariant", "{}", message);
        panic!("dotmod invariant violated: {}", message);
    }};
}
