//! Logging shims
//!
//! Every log level funnels through [`log!`], which forwards to `defmt`
//! when that feature is enabled. Without it the arguments are consumed
//! without generating any code.

#![allow(unused_macros)]
#![allow(unused_imports)]

macro_rules! log {
    ($level:ident, $s:literal $(, $x:expr)* $(,)?) => {
        {
            #[cfg(feature = "defmt")]
            ::defmt::$level!($s $(, $x)*);
            #[cfg(not(feature = "defmt"))]
            {
                $( let _ = &$x; )*
            }
        }
    };
}

macro_rules! trace {
    ($($args:tt)*) => { crate::fmt::log!(trace, $($args)*) };
}

macro_rules! debug {
    ($($args:tt)*) => { crate::fmt::log!(debug, $($args)*) };
}

macro_rules! info {
    ($($args:tt)*) => { crate::fmt::log!(info, $($args)*) };
}

macro_rules! warning {
    ($($args:tt)*) => { crate::fmt::log!(warn, $($args)*) };
}

pub(crate) use {debug, info, log, trace, warning};
