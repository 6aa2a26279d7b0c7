//! Serial logging macros.
//!
//! Everything goes to the architecture serial port; on the host builds the
//! sink is standard output under test. There is no terminal mirror on this
//! board.

/// prints to the serial port without a trailing newline
#[macro_export]
macro_rules! serial {
    ($($arg:tt)*) => {
        $crate::arch::serial::_serial(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! logln {
    ($($arg:tt)*) => {
        $crate::serial!("{}\n", format_args!($($arg)*));
    };
}

/// runtime debug info, takes a $mod and an Arguments, mod must be a type
#[macro_export]
macro_rules! debug {
    ($mod: path, $($arg:tt)*) => {
        // makes sure $mod is a valid type
        let _ = core::marker::PhantomData::<$mod>;
        $crate::logln!("[ \x1B[91mdebug\x1B[0m ]\x1B[90m {}:\x1B[0m {}", stringify!($mod), format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::logln!("[ \x1B[92minfo\x1B[0m  ]\x1b[90m:\x1B[0m {}", format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::logln!("[ \x1B[93mwarn\x1B[0m  ]\x1b[90m:\x1B[0m {}", format_args!($($arg)*));
    };
}

/// Marker types used as the `$mod` tag of [`debug!`].
pub struct Runtime;
pub struct Scheduler;
pub struct Vm;
pub struct Tasks;
pub struct Threads;
