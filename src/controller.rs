//! NVMe controller lifecycle and admin command dispatch
//!
//! Sequences the controller from a mapped register block to a ready
//! state (disable, configure admin queues, enable, unmask interrupts),
//! with every ready-bit poll bounded by the worst-case timeout the
//! controller advertises in CAP.TO. Once ready, callers issue Identify
//! and Abort commands and a dedicated task services the interrupt line.

use alloc::string::String;

use log::{debug, info};
use spin::Mutex;

use crate::{
    commands::{IDENTIFY_DATA_SIZE, IdentifyController, NvmeCommand, identify_cns},
    hal::{DmaRegion, NvmeHal},
    queue::{ADMIN_QUEUE_ID, AdminQueue, CQ_ENTRY_SIZE, CommandHandle, QueueStats, SQ_ENTRY_SIZE},
    registers::NvmeRegisters,
};

/// Interval between ready-bit checks; CAP.TO counts in the same unit.
const READY_POLL_INTERVAL_US: u64 = 500_000;

/// NVMe controller errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvmeError {
    /// The host environment could not map the register block
    MappingFailed,
    /// The host environment could not provide DMA memory
    AllocationFailed,
    /// The ready bit did not clear within CAP.TO after disabling
    ControllerResetTimeout,
    /// The ready bit did not set within CAP.TO after enabling
    ControllerEnableTimeout,
    /// The controller reported fatal status (CSTS.CFS)
    ControllerFatal,
    /// Admin queue registers may only be written while disabled
    ControllerNotDisabled,
    /// Requested queue depth outside what the controller supports
    InvalidQueueDepth,
    /// A supplied buffer is too small for the rings or data page
    InvalidBuffer,
    /// All submission slots are outstanding; retry after a completion
    QueueFull,
    /// Opcode outside the supported admin command set
    UnsupportedCommand(u8),
    /// The device completed the command with a non-zero status field
    CommandFailed(u16),
}

/// Controller lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Unmapped,
    Mapped,
    Disabling,
    Disabled,
    QueuesConfigured,
    Enabling,
    Ready,
    Fatal,
}

/// Initialization parameters.
#[derive(Debug, Clone, Copy)]
pub struct ControllerConfig {
    /// Entries in each admin ring. Bounded below by 2 and above by the
    /// controller's CAP.MQES.
    pub queue_depth: u16,
    /// Maximum completion entries drained per interrupt
    pub completion_burst: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            queue_depth: 8,
            completion_burst: 8,
        }
    }
}

/// Identity of a controller, decoded from an Identify (CNS=1) data page
#[derive(Debug, Clone)]
pub struct ControllerInfo {
    pub model: String,
    pub serial: String,
    pub firmware: String,
    pub version: u32,
    pub namespace_count: u32,
    pub abort_limit: u8,
}

/// An initialized NVMe controller's admin control path.
///
/// All hardware collaborators come in through the [`NvmeHal`]; the value
/// itself is the device context and is passed (by reference) to every
/// operation, including the interrupt service task.
pub struct NvmeController<H: NvmeHal> {
    pub(crate) hal: H,
    pub(crate) regs: NvmeRegisters,
    pub(crate) admin: Mutex<AdminQueue>,
    pub(crate) state: ControllerState,
    pub(crate) timeout_units: u64,
    pub(crate) completion_burst: usize,
}

impl<H: NvmeHal> NvmeController<H> {
    /// Map the controller and bring it to the ready state.
    ///
    /// Runs the full lifecycle: map registers, disable if enabled,
    /// program the admin queue registers, enable, and unmask the admin
    /// queue interrupt. A poll timeout leaves the controller fatal and
    /// is returned as a hard error; there is no automatic retry.
    pub fn new(hal: H, config: ControllerConfig) -> Result<Self, NvmeError> {
        info!("Initializing NVMe controller");

        let base = hal.map_register_region()?;
        // The HAL guarantees the mapping stays valid for the device's
        // lifetime.
        let regs = unsafe { NvmeRegisters::new(base) };

        let max_entries = regs.max_queue_entries();
        let timeout_units = regs.timeout_units();

        debug!("NVMe controller capabilities:");
        debug!("  Max queue entries: {}", max_entries);
        debug!("  Doorbell stride: {} bytes", regs.doorbell_stride());
        debug!("  Min page size: {} bytes", regs.min_page_size());
        debug!("  Worst-case timeout: {} ms", timeout_units * 500);

        if config.queue_depth < 2 || config.queue_depth > max_entries {
            return Err(NvmeError::InvalidQueueDepth);
        }

        let depth = config.queue_depth;
        let sq_mem = hal.alloc_dma(depth as usize * SQ_ENTRY_SIZE)?;
        let cq_mem = hal.alloc_dma(depth as usize * CQ_ENTRY_SIZE)?;
        let admin = AdminQueue::new(sq_mem, cq_mem, depth)?;

        let mut controller = Self {
            hal,
            regs,
            admin: Mutex::new(admin),
            state: ControllerState::Mapped,
            timeout_units,
            completion_burst: config.completion_burst,
        };

        controller.reset_controller()?;
        controller.configure_admin_queues()?;
        controller.enable_controller()?;

        controller.regs.unmask_queue_interrupt(ADMIN_QUEUE_ID);
        controller.state = ControllerState::Ready;
        info!("NVMe controller ready");

        Ok(controller)
    }

    /// Current lifecycle state
    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Admin queue dispatch counters
    pub fn stats(&self) -> QueueStats {
        self.admin.lock().stats()
    }

    // Poll CSTS.RDY until it reaches `want`, bounded by CAP.TO in 500 ms
    // steps. Fatal status short-cuts the poll.
    pub(crate) fn wait_ready(&mut self, want: bool, timeout_err: NvmeError) -> Result<(), NvmeError> {
        for _ in 0..=self.timeout_units {
            if self.regs.is_fatal() {
                self.state = ControllerState::Fatal;
                return Err(NvmeError::ControllerFatal);
            }
            if self.regs.is_ready() == want {
                return Ok(());
            }
            self.hal.delay_us(READY_POLL_INTERVAL_US);
        }

        self.state = ControllerState::Fatal;
        Err(timeout_err)
    }

    /// Clear the enable bit if set and wait for the controller to report
    /// not-ready.
    pub(crate) fn reset_controller(&mut self) -> Result<(), NvmeError> {
        if self.regs.is_enabled() {
            info!("Disabling NVMe controller");
            self.state = ControllerState::Disabling;
            self.regs.disable();
        }

        self.wait_ready(false, NvmeError::ControllerResetTimeout)?;
        self.state = ControllerState::Disabled;
        Ok(())
    }

    /// Program admin queue depths and ring base addresses.
    ///
    /// AQA/ASQ/ACQ may only be written while the controller is disabled;
    /// attempting this with the enable bit set is rejected.
    pub(crate) fn configure_admin_queues(&mut self) -> Result<(), NvmeError> {
        if self.regs.is_enabled() {
            return Err(NvmeError::ControllerNotDisabled);
        }

        let admin = self.admin.get_mut();
        let depth = admin.depth();

        self.regs.set_admin_queue_attributes(depth, depth);
        self.regs.set_admin_sq_base(admin.sq_phys());
        self.regs.set_admin_cq_base(admin.cq_phys());

        info!(
            "Admin queues configured: SQ={:#x}, CQ={:#x}, depth={}",
            admin.sq_phys(),
            admin.cq_phys(),
            depth
        );

        self.state = ControllerState::QueuesConfigured;
        Ok(())
    }

    /// Write the configuration register (round-robin arbitration, NVM
    /// command set, 4 KiB pages, entry-size exponents, enable) and wait
    /// for ready.
    pub(crate) fn enable_controller(&mut self) -> Result<(), NvmeError> {
        info!("Enabling NVMe controller");
        self.state = ControllerState::Enabling;
        self.regs.configure();

        self.wait_ready(true, NvmeError::ControllerEnableTimeout)
    }

    /// Issue an IDENTIFY command. `buffer` receives the 4096-byte data
    /// page and must be at least that large.
    ///
    /// Slot allocation, command construction, the submission-entry write
    /// and the doorbell all happen under one hold of the queue lock, so
    /// the tail never advances past an unwritten entry.
    pub fn identify(
        &self,
        cns: u8,
        cntid: u16,
        nsid: u32,
        buffer: &DmaRegion,
    ) -> Result<CommandHandle, NvmeError> {
        if buffer.len < IDENTIFY_DATA_SIZE {
            return Err(NvmeError::InvalidBuffer);
        }

        let mut admin = self.admin.lock();
        let slot = admin.allocate_slot()?;
        let cmd = NvmeCommand::identify(slot, cns, cntid, nsid, buffer.phys.as_u64());
        let handle = admin.construct(slot, cmd);
        admin.submit(&self.regs, slot);
        Ok(handle)
    }

    /// Issue an ABORT for an outstanding command, addressed by its
    /// submission queue id and CID.
    pub fn abort(&self, sqid: u16, cid: u16) -> Result<CommandHandle, NvmeError> {
        let mut admin = self.admin.lock();
        let slot = admin.allocate_slot()?;
        let cmd = NvmeCommand::abort(slot, sqid, cid);
        let handle = admin.construct(slot, cmd);
        admin.submit(&self.regs, slot);
        Ok(handle)
    }

    /// Identify the controller (CNS=1) and decode the interesting fields.
    pub fn identify_controller(&self) -> Result<ControllerInfo, NvmeError> {
        let buffer = self.hal.alloc_dma(IDENTIFY_DATA_SIZE)?;

        let handle = self.identify(identify_cns::CONTROLLER, 0, 0, &buffer)?;
        let completion = handle.wait(&self.hal);

        if !completion.is_success() {
            return Err(NvmeError::CommandFailed(completion.status_field()));
        }

        let data = unsafe { &*buffer.virt.as_ptr::<IdentifyController>() };

        let info = ControllerInfo {
            model: String::from(data.model()),
            serial: String::from(data.serial()),
            firmware: String::from(data.firmware()),
            version: data.ver,
            namespace_count: data.nn,
            abort_limit: data.acl,
        };

        info!("Controller information:");
        info!("  Model: {}", info.model);
        info!("  Serial: {}", info.serial);
        info!("  Firmware: {}", info.firmware);
        info!("  Version: {:#x}", info.version);
        info!("  Namespaces: {}", info.namespace_count);

        Ok(info)
    }

    /// Service one admin interrupt: mask the queue's vector, drain the
    /// completion ring under the queue lock, unmask.
    ///
    /// Masking only suppresses redundant wakeups for the same batch; the
    /// queue lock is what protects the ring bookkeeping. Returns the
    /// number of completions retired.
    pub fn handle_interrupt(&self) -> usize {
        self.regs.mask_queue_interrupt(ADMIN_QUEUE_ID);

        let drained = {
            let mut admin = self.admin.lock();
            admin.poll_completions(&self.regs, self.completion_burst)
        };

        self.regs.unmask_queue_interrupt(ADMIN_QUEUE_ID);
        drained
    }

    /// Interrupt service loop for the dedicated dispatcher task: block on
    /// the device interrupt, drain, repeat.
    pub fn run_interrupt_loop(&self) -> ! {
        loop {
            self.hal.wait_for_interrupt();
            let drained = self.handle_interrupt();
            debug!("admin interrupt: {} completion(s)", drained);
        }
    }
}
