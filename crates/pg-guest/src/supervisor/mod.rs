// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container supervisors.

pub mod docker;
pub mod mock;
mod traits;

pub use docker::{DockerSupervisor, DockerSupervisorConfig};
pub use mock::{MockSupervisor, SupervisorCall};
pub use traits::*;
