//! Logging macros which forward to `defmt` or `log` depending on which
//! feature is enabled, and compile to nothing when neither is.  This is the
//! usual shim for crates that run both on embedded targets (defmt) and on
//! the host (log), for example in tests.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#![allow(unused_macros)]

#[cfg(all(feature = "defmt", feature = "log"))]
compile_error!("Features 'defmt' and 'log' cannot be enabled simultaneously");

macro_rules! trace {
    ($($arg:expr),* $(,)?) => {
        {
            #[cfg(feature = "defmt")]
            ::defmt::trace!($($arg),*);
            #[cfg(feature = "log")]
            ::log::trace!($($arg),*);
            #[cfg(not(any(feature = "defmt", feature = "log")))]
            let _ = ($(&$arg),*);
        }
    };
}

macro_rules! debug {
    ($($arg:expr),* $(,)?) => {
        {
            #[cfg(feature = "defmt")]
            ::defmt::debug!($($arg),*);
            #[cfg(feature = "log")]
            ::log::debug!($($arg),*);
            #[cfg(not(any(feature = "defmt", feature = "log")))]
            let _ = ($(&$arg),*);
        }
    };
}

macro_rules! info {
    ($($arg:expr),* $(,)?) => {
        {
            #[cfg(feature = "defmt")]
            ::defmt::info!($($arg),*);
            #[cfg(feature = "log")]
            ::log::info!($($arg),*);
            #[cfg(not(any(feature = "defmt", feature = "log")))]
            let _ = ($(&$arg),*);
        }
    };
}

macro_rules! warn {
    ($($arg:expr),* $(,)?) => {
        {
            #[cfg(feature = "defmt")]
            ::defmt::warn!($($arg),*);
            #[cfg(feature = "log")]
            ::log::warn!($($arg),*);
            #[cfg(not(any(feature = "defmt", feature = "log")))]
            let _ = ($(&$arg),*);
        }
    };
}

macro_rules! error {
    ($($arg:expr),* $(,)?) => {
        {
            #[cfg(feature = "defmt")]
            ::defmt::error!($($arg),*);
            #[cfg(feature = "log")]
            ::log::error!($($arg),*);
            #[cfg(not(any(feature = "defmt", feature = "log")))]
            let _ = ($(&$arg),*);
        }
    };
}
