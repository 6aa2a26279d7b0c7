/// Errno values used across the FTL/StorPU/guest boundary.
///
/// Guest-visible entry points return `0` or a small non-negative result on
/// success and `-(errno)` on failure; runtime-internal code carries these in
/// `Result<T, Errno>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    /// Operation not permitted
    EPERM = 1,
    /// No such thread or context
    ESRCH = 3,
    /// I/O error reported by the FTL
    EIO = 5,
    /// Not an executable image
    ENOEXEC = 8,
    /// Try again (e.g. reader count overflow)
    EAGAIN = 11,
    /// Out of memory
    ENOMEM = 12,
    /// Bad address or untranslatable buffer
    EFAULT = 14,
    /// Resource busy
    EBUSY = 16,
    /// Already exists (cache insert collision)
    EEXIST = 17,
    /// Invalid argument
    EINVAL = 22,
    /// Deadlock avoided (joining self)
    EDEADLK = 35,
    /// Operation not implemented
    ENOSYS = 38,
    /// Operation timed out
    ETIMEDOUT = 110,
}

impl Errno {
    /// Gives a short description of the error
    pub fn as_str(&self) -> &'static str {
        use Errno::*;
        match *self {
            EPERM => "Operation not permitted",
            ESRCH => "No such thread or context",
            EIO => "I/O error",
            ENOEXEC => "Not executable",
            EAGAIN => "Try again",
            ENOMEM => "Out of memory",
            EFAULT => "Bad address",
            EBUSY => "Busy",
            EEXIST => "Already exists",
            EINVAL => "Invalid argument",
            EDEADLK => "Deadlock avoided",
            ENOSYS => "Not implemented",
            ETIMEDOUT => "Timed out",
        }
    }

    /// The negated form guest entry points return.
    #[inline(always)]
    pub const fn to_neg(self) -> isize {
        -(self as i32 as isize)
    }
}

impl TryFrom<i32> for Errno {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, i32> {
        use Errno::*;
        Ok(match value {
            1 => EPERM,
            3 => ESRCH,
            5 => EIO,
            8 => ENOEXEC,
            11 => EAGAIN,
            12 => ENOMEM,
            14 => EFAULT,
            16 => EBUSY,
            17 => EEXIST,
            22 => EINVAL,
            35 => EDEADLK,
            38 => ENOSYS,
            110 => ETIMEDOUT,
            other => return Err(other),
        })
    }
}

impl core::fmt::Display for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::error::Error for Errno {}

/// Maps a `Result` to the C-style `0 | -errno` convention.
#[inline]
pub fn errno_result(r: Result<(), Errno>) -> isize {
    match r {
        Ok(()) => 0,
        Err(e) => e.to_neg(),
    }
}

/// Maps a `Result<usize>` to the C-style `count | -errno` convention.
#[inline]
pub fn errno_count(r: Result<usize, Errno>) -> isize {
    match r {
        Ok(n) => n as isize,
        Err(e) => e.to_neg(),
    }
}
