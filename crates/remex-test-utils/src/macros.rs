// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Assertions that leave a trace in the test log before panicking.

/// Logs the condition, then asserts it.
///
/// ```rust,ignore
/// logged_assert!(logger, results.is_empty(), "empty pin set yields no results");
/// ```
#[macro_export]
macro_rules! logged_assert {
    ($logger:expr, $condition:expr) => {
        $crate::logged_assert!($logger, $condition, stringify!($condition))
    };
    ($logger:expr, $condition:expr, $message:expr) => {{
        let _ = $logger.log(&format!("assert: {}", $message));
        if $condition {
            let _ = $logger.log("  ok");
        } else {
            let _ = $logger.log("  FAILED");
            panic!("assertion failed: {}", $message);
        }
    }};
}

/// Logs both operands, then asserts equality.
#[macro_export]
macro_rules! logged_assert_eq {
    ($logger:expr, $left:expr, $right:expr) => {{
        let left = &$left;
        let right = &$right;
        let _ = $logger.log(&format!(
            "assert_eq: {} == {}",
            stringify!($left),
            stringify!($right)
        ));
        if *left == *right {
            let _ = $logger.log("  ok");
        } else {
            let message = format!(
                "assertion failed: `(left == right)`\n  left: `{:?}`,\n right: `{:?}`",
                left, right
            );
            let _ = $logger.log(&format!("  FAILED: {}", message));
            panic!("{}", message);
        }
    }};
}
