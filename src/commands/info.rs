// SPDX-License-Identifier: Apache-2.0

use crate::version::BuildInfo;

pub fn run() {
    println!("{}", BuildInfo::current());
}
