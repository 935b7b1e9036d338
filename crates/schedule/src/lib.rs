// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Schedule-based preservation of snapshots and backups
//!
//! This crate is the pure core of snapship: it decides which snapshots and
//! backup objects should exist at a given moment, without touching the
//! filesystem or the network.
//!
//! - [`timeframe`] maps instants to calendar buckets (year, quarter, month,
//!   week, day, hour, minute, second) in an explicit IANA timezone.
//! - [`policy`] parses btrbk-style preservation parameters (`1y 3m 30d`)
//!   and fixes the set of wanted buckets relative to a "now".
//! - [`resolver`] consumes the inventory and produces the keep set, with a
//!   send-parent for every kept item.
//! - [`planner`] diffs the keep set against the inventory and emits an
//!   ordered, validated action plan.
//!
//! The timezone is an explicit argument everywhere. Changing it reshuffles
//! bucket membership and can expire backups; that hazard belongs to the
//! operator, not to this crate.

mod error;
pub mod item;
pub mod planner;
pub mod policy;
pub mod resolver;
pub mod timeframe;

pub use error::{Result, ScheduleError};
pub use item::{Item, ItemId, Presence};
pub use planner::{plan, Action, Plan};
pub use policy::{Params, Policy};
pub use resolver::{resolve, Kept, Reasons, Resolution, ResolveInput};
pub use timeframe::{bucket, enumerate_buckets, Bucket, Timeframe};
