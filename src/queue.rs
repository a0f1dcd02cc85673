//! Admin queue pair management
//!
//! Owns the admin submission/completion rings in DMA-visible memory and
//! the per-slot command bookkeeping: round-robin slot (CID) allocation,
//! tail-doorbell submission, and the phase-tracked completion drain that
//! retires slots and signals their waiters.
//!
//! All state here is mutated under one external lock; the controller
//! wraps the queue in a mutex and serialises submission against the
//! completion drain.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering, fence};

use log::warn;
use spin::Mutex;

use crate::{
    commands::{NvmeCommand, NvmeCompletion},
    controller::NvmeError,
    hal::{DmaRegion, NvmeHal},
    registers::NvmeRegisters,
};

/// Queue id of the admin queue pair
pub const ADMIN_QUEUE_ID: u16 = 0;

/// Bytes per submission queue entry
pub const SQ_ENTRY_SIZE: usize = core::mem::size_of::<NvmeCommand>();
/// Bytes per completion queue entry
pub const CQ_ENTRY_SIZE: usize = core::mem::size_of::<NvmeCompletion>();

/// Lifecycle of a submission slot.
///
/// A slot counts as outstanding from allocation until the completion
/// drain retires it; its index doubles as the command's CID, so no two
/// outstanding commands can share a CID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Constructed,
    Submitted,
    Completed,
}

/// Dispatch counters, readable without touching ring state
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub completions: u64,
    pub unknown_cid: u64,
}

// Shared between the dispatcher and the one caller waiting on a slot.
// `result` is written before `done` is released, so a reader that
// observes `done` always finds the completion.
struct CompletionCell {
    done: AtomicBool,
    result: Mutex<Option<NvmeCompletion>>,
}

struct Slot {
    state: SlotState,
    waiter: Option<Arc<CompletionCell>>,
}

/// A caller's handle to one in-flight admin command.
///
/// The dispatcher signals the handle when the device posts the matching
/// completion; waiting takes no locks shared with the queue.
pub struct CommandHandle {
    cell: Arc<CompletionCell>,
    cid: u16,
}

impl CommandHandle {
    /// The command identifier (submission slot index)
    pub fn cid(&self) -> u16 {
        self.cid
    }

    /// Whether the device has completed the command
    pub fn is_complete(&self) -> bool {
        self.cell.done.load(Ordering::Acquire)
    }

    /// The completion entry, if the command has completed
    pub fn try_result(&self) -> Option<NvmeCompletion> {
        if !self.is_complete() {
            return None;
        }
        *self.cell.result.lock()
    }

    /// Block until the command completes, yielding between checks.
    ///
    /// There is no command-level timeout: a command the device never
    /// completes waits forever, and its slot stays outstanding.
    pub fn wait<H: NvmeHal>(&self, hal: &H) -> NvmeCompletion {
        loop {
            if let Some(completion) = self.try_result() {
                return completion;
            }
            hal.yield_now();
        }
    }
}

/// The admin submission/completion queue pair.
pub struct AdminQueue {
    sq_mem: DmaRegion,
    cq_mem: DmaRegion,
    depth: u16,
    /// Next submission slot offered, advancing round-robin
    next_slot: u16,
    /// Submission tail as last written to the doorbell
    sq_tail: u16,
    /// Completion head, advanced as entries are drained
    cq_head: u16,
    /// Expected phase tag; starts at 1, flips on each completion wrap
    phase: bool,
    slots: Vec<Slot>,
    stats: QueueStats,
}

impl AdminQueue {
    /// Build a queue pair over caller-allocated ring memory. Both regions
    /// must be zeroed, or stale memory would match the initial phase.
    pub fn new(sq_mem: DmaRegion, cq_mem: DmaRegion, depth: u16) -> Result<Self, NvmeError> {
        if depth < 2 {
            return Err(NvmeError::InvalidQueueDepth);
        }
        if sq_mem.len < depth as usize * SQ_ENTRY_SIZE
            || cq_mem.len < depth as usize * CQ_ENTRY_SIZE
        {
            return Err(NvmeError::InvalidBuffer);
        }

        let slots = (0..depth)
            .map(|_| Slot {
                state: SlotState::Free,
                waiter: None,
            })
            .collect();

        Ok(Self {
            sq_mem,
            cq_mem,
            depth,
            next_slot: 0,
            sq_tail: 0,
            cq_head: 0,
            phase: true,
            slots,
            stats: QueueStats::default(),
        })
    }

    /// Queue depth (entries per ring)
    pub fn depth(&self) -> u16 {
        self.depth
    }

    /// Physical address of the submission ring
    pub fn sq_phys(&self) -> u64 {
        self.sq_mem.phys.as_u64()
    }

    /// Physical address of the completion ring
    pub fn cq_phys(&self) -> u64 {
        self.cq_mem.phys.as_u64()
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    pub fn slot_state(&self, slot: u16) -> SlotState {
        self.slots[slot as usize].state
    }

    /// Reserve the next submission slot in ring order.
    ///
    /// Slots are reused strictly in ring order; if the next position is
    /// still outstanding the ring is full. `QueueFull` is retryable once
    /// a completion retires that slot.
    pub fn allocate_slot(&mut self) -> Result<u16, NvmeError> {
        let slot = self.next_slot;
        if self.slots[slot as usize].state != SlotState::Free {
            return Err(NvmeError::QueueFull);
        }
        self.slots[slot as usize].state = SlotState::Constructed;
        self.next_slot = (slot + 1) % self.depth;
        Ok(slot)
    }

    /// Write a constructed command into its slot's submission entry and
    /// hand back the waiter handle. The command's CID must be the slot.
    pub fn construct(&mut self, slot: u16, cmd: NvmeCommand) -> CommandHandle {
        debug_assert_eq!(cmd.command_id(), slot);
        debug_assert_eq!(self.slots[slot as usize].state, SlotState::Constructed);

        unsafe {
            let entry_ptr = self
                .sq_mem
                .virt
                .as_mut_ptr::<NvmeCommand>()
                .add(slot as usize);
            core::ptr::write_volatile(entry_ptr, cmd);
        }

        let cell = Arc::new(CompletionCell {
            done: AtomicBool::new(false),
            result: Mutex::new(None),
        });
        self.slots[slot as usize].waiter = Some(cell.clone());

        CommandHandle { cell, cid: slot }
    }

    /// Advance the submission tail past `slot` and ring the tail
    /// doorbell. This is the single point at which the device learns of
    /// the command; nothing is visible to hardware before this write.
    pub fn submit(&mut self, regs: &NvmeRegisters, slot: u16) {
        self.slots[slot as usize].state = SlotState::Submitted;
        self.sq_tail = (slot + 1) % self.depth;

        // The entry write must be globally visible before the doorbell.
        fence(Ordering::SeqCst);

        regs.ring_doorbell(ADMIN_QUEUE_ID, false, self.sq_tail);
    }

    /// Drain newly posted completion entries, in ring order only.
    ///
    /// An entry is new iff its phase tag matches the expected phase;
    /// draining stops at the first mismatch or after `burst` entries.
    /// The head doorbell is written once after the drain, and the
    /// expected phase flips each time the head wraps to zero. Returns
    /// the number of entries retired.
    pub fn poll_completions(&mut self, regs: &NvmeRegisters, burst: usize) -> usize {
        let mut drained = 0;

        while drained < burst {
            fence(Ordering::SeqCst);

            let completion = unsafe {
                let entry_ptr = self
                    .cq_mem
                    .virt
                    .as_ptr::<NvmeCompletion>()
                    .add(self.cq_head as usize);
                core::ptr::read_volatile(entry_ptr)
            };

            if !completion.is_valid(self.phase) {
                break;
            }

            self.cq_head = (self.cq_head + 1) % self.depth;
            if self.cq_head == 0 {
                self.phase = !self.phase;
            }

            self.retire(completion);
            drained += 1;
        }

        if drained > 0 {
            regs.ring_doorbell(ADMIN_QUEUE_ID, true, self.cq_head);
        }

        drained
    }

    // Match a drained completion to its submission slot, deliver the
    // result, and recycle the slot. A CID with no outstanding slot is a
    // protocol violation; it is counted and the drain continues, since
    // the device may still post valid completions for other slots.
    fn retire(&mut self, completion: NvmeCompletion) {
        let cid = completion.cid;

        let slot = match self.slots.get_mut(cid as usize) {
            Some(slot) if slot.state == SlotState::Submitted => slot,
            _ => {
                warn!("completion with no outstanding command: CID {}", cid);
                self.stats.unknown_cid += 1;
                return;
            }
        };

        slot.state = SlotState::Completed;
        if let Some(cell) = slot.waiter.take() {
            *cell.result.lock() = Some(completion);
            cell.done.store(true, Ordering::Release);
        }

        slot.state = SlotState::Free;
        self.stats.completions += 1;
    }
}
