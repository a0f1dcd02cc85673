//! Admin control path for PCI-attached NVMe controllers.
//!
//! This crate brings a controller from power-on to a ready state and
//! drives the admin submission/completion queue pair: slot allocation,
//! command construction for the supported admin opcodes, doorbell
//! signalling, and interrupt-driven completion dispatch.
//!
//! PCI discovery, BAR mapping, interrupt delivery and DMA allocation are
//! not implemented here; the host environment supplies them through the
//! [`hal::NvmeHal`] trait.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod commands;
pub mod controller;
pub mod hal;
pub mod queue;
pub mod registers;


pub use commands::{AdminOpcode, IdentifyController, NvmeCommand, NvmeCompletion};
pub use controller::{
    ControllerConfig, ControllerInfo, ControllerState, NvmeController, NvmeError,
};
pub use hal::{DmaRegion, NvmeHal};
pub use queue::{ADMIN_QUEUE_ID, AdminQueue, CommandHandle, QueueStats, SlotState};
