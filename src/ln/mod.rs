// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Implementations of extensions on top of the lightning protocol to route HTLCs between
//! channels, as described in BOLT #2 and BOLT #4.

pub mod interfaces;
pub mod link;
pub mod mailbox;
pub mod msgs;
pub mod switch;
pub mod types;
