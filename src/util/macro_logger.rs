// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Logging macros which wrap [`Logger`](crate::util::logger::Logger) objects.

use std::fmt;

/// Wrapper for logging byte slices in hex format.
#[doc(hidden)]
pub struct DebugBytes<'a>(pub &'a [u8]);
impl<'a> fmt::Display for DebugBytes<'a> {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		for i in self.0 {
			write!(f, "{:02x}", i)?;
		}
		Ok(())
	}
}

/// Logs a byte slice in hex format.
#[macro_export]
macro_rules! log_bytes {
	($obj: expr) => {
		$crate::util::macro_logger::DebugBytes(&$obj)
	};
}

/// Create a new Record and log it. You probably don't want to use this macro directly,
/// but it needs to be exported so `log_trace` etc can use it in external crates.
#[doc(hidden)]
#[macro_export]
macro_rules! log_internal {
	($logger: expr, $lvl:expr, $($arg:tt)+) => (
		$logger.log(&$crate::util::logger::Record::new($lvl, format_args!($($arg)+), module_path!(), file!(), line!()))
	);
}

/// Log an error.
#[macro_export]
macro_rules! log_error {
	($logger: expr, $($arg:tt)*) => (
		log_internal!($logger, $crate::util::logger::Level::Error, $($arg)*)
	)
}

/// Log a warning.
#[macro_export]
macro_rules! log_warn {
	($logger: expr, $($arg:tt)*) => (
		log_internal!($logger, $crate::util::logger::Level::Warn, $($arg)*)
	)
}

/// Log an entry at the info level.
#[macro_export]
macro_rules! log_info {
	($logger: expr, $($arg:tt)*) => (
		log_internal!($logger, $crate::util::logger::Level::Info, $($arg)*)
	)
}

/// Log an entry at the debug level.
#[macro_export]
macro_rules! log_debug {
	($logger: expr, $($arg:tt)*) => (
		log_internal!($logger, $crate::util::logger::Level::Debug, $($arg)*)
	)
}

/// Log an entry at the trace level, generally the most verbose.
#[macro_export]
macro_rules! log_trace {
	($logger: expr, $($arg:tt)*) => (
		log_internal!($logger, $crate::util::logger::Level::Trace, $($arg)*)
	)
}
