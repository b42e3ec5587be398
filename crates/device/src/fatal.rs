// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Fail-fast diagnostics for the execution core.
//!
//! Allocator corruption, lifecycle misorder and shape mismatches inside the
//! graph are programming errors with no recovery path. [`infer_assert!`] and
//! [`fatal!`] print the failing condition with its location to stderr, emit
//! a `tracing` error event, then panic. Release builds use `panic = "abort"`,
//! so the panic terminates the process.
//!
//! ```should_panic
//! use device::infer_assert;
//!
//! let requested = 64;
//! infer_assert!(requested <= 32, "workspace underflow: need {requested} bytes");
//! ```

use std::fmt;

/// Asserts `cond`, reporting a fatal diagnostic with a formatted message on
/// failure.
#[macro_export]
macro_rules! infer_assert {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::fatal::report(
                stringify!($cond),
                file!(),
                line!(),
                $crate::__function_name!(),
                format_args!($($arg)+),
            );
        }
    };
}

/// Reports an unconditional fatal diagnostic. Evaluates to `!`.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)+) => {
        $crate::fatal::report(
            "unreachable",
            file!(),
            line!(),
            $crate::__function_name!(),
            format_args!($($arg)+),
        )
    };
}

/// Expands to the path of the enclosing function.
#[doc(hidden)]
#[macro_export]
macro_rules! __function_name {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            ::std::any::type_name::<T>()
        }
        let name = type_name_of(f);
        name.strip_suffix("::f").unwrap_or(name)
    }};
}

/// Emits the diagnostic and panics. Called by the macros.
#[doc(hidden)]
#[cold]
#[inline(never)]
pub fn report(
    cond: &str,
    file: &str,
    line: u32,
    function: &str,
    message: fmt::Arguments<'_>,
) -> ! {
    let text = format!(
        "Assert ' {cond} ' failed at file: {file}\nline {line} : {function},\nextra message: {message}"
    );
    eprintln!("{text}");
    tracing::error!(target: "infer::fatal", file, line, function, "{message}");
    panic!("{text}");
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_passing_assert_is_silent() {
        let n = 4;
        infer_assert!(n % 2 == 0, "odd {n}");
    }

    #[test]
    #[should_panic(expected = "extra message: bad block 7")]
    fn test_failing_assert_panics_with_message() {
        let id = 7;
        infer_assert!(id < 3, "bad block {id}");
    }

    #[test]
    #[should_panic(expected = "test_fatal_reports_function")]
    fn test_fatal_reports_function() {
        fatal!("boom");
    }

    #[test]
    fn test_function_name() {
        let name = __function_name!();
        assert!(name.ends_with("tests::test_function_name"), "{name}");
    }
}
