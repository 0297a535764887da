//! Cross-core barrier guarding translation changes of live domains.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering, fence};

use axerrno::{AxResult, ax_err};

use crate::Hal;

/// Vector of the IPI that asks the other cores to park.
pub const SHOOTDOWN_VECTOR: u8 = 0xF2;

/// Shootdown state shared by every core.
///
/// The initiator takes `lock`, opens a new round in `active`, interrupts
/// every other core and waits until all of them have acknowledged that
/// round. Parked cores spin until the round is closed again. Acks carry
/// the round's generation in their upper half, so an ack for a round that
/// already timed out never counts towards a later one.
#[derive(Debug, Default)]
pub struct Shootdown {
    lock: AtomicBool,
    next_gen: AtomicU32,
    /// Generation of the open round, 0 when none is.
    active: AtomicU32,
    /// `generation << 32 | count`.
    acks: AtomicU64,
}

impl Shootdown {
    pub const fn new() -> Self {
        Self {
            lock: AtomicBool::new(false),
            next_gen: AtomicU32::new(0),
            active: AtomicU32::new(0),
            acks: AtomicU64::new(0),
        }
    }

    /// Whether a shootdown is in progress.
    pub fn is_pending(&self) -> bool {
        self.active.load(Ordering::Acquire) != 0
    }

    /// Generation of the round in progress, if any.
    pub(crate) fn generation(&self) -> Option<u32> {
        match self.active.load(Ordering::Acquire) {
            0 => None,
            generation => Some(generation),
        }
    }

    /// Counts one core towards round `generation`. Fails once that round
    /// is no longer the one collecting acks.
    pub(crate) fn acknowledge(&self, generation: u32) -> bool {
        self.acks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |acks| {
                ((acks >> 32) as u32 == generation).then_some(acks + 1)
            })
            .is_ok()
    }

    fn acked(&self, generation: u32) -> usize {
        let acks = self.acks.load(Ordering::Acquire);
        if (acks >> 32) as u32 == generation {
            acks as u32 as usize
        } else {
            0
        }
    }

    /// Runs `f` while every other core is parked in [`Shootdown::wait`].
    ///
    /// With `spin_limit` set, gives up with `ResourceBusy` when the other
    /// cores have not all acknowledged after that many polling rounds, and
    /// `f` is not run.
    pub fn initiate<H: Hal, R>(&self, spin_limit: Option<usize>, f: impl FnOnce() -> R) -> AxResult<R> {
        let others = H::cpu_count().saturating_sub(1);
        if others == 0 {
            return Ok(f());
        }

        if self
            .lock
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return ax_err!(ResourceBusy, "another shootdown is in progress");
        }
        let mut generation = self.next_gen.load(Ordering::Relaxed).wrapping_add(1);
        if generation == 0 {
            generation = 1;
        }
        self.next_gen.store(generation, Ordering::Relaxed);
        self.acks.store((generation as u64) << 32, Ordering::Release);
        self.active.store(generation, Ordering::Release);
        trace!("[HK] shootdown {}: signalling {} cores", generation, others);
        H::send_ipi_all_but_self(SHOOTDOWN_VECTOR);

        let mut spins = 0usize;
        while self.acked(generation) < others {
            if spin_limit.is_some_and(|limit| spins >= limit) {
                warn!(
                    "[HK] shootdown {}: {} of {} cores acknowledged, giving up",
                    generation,
                    self.acked(generation),
                    others
                );
                self.release();
                return ax_err!(ResourceBusy, "shootdown timed out");
            }
            spins += 1;
            core::hint::spin_loop();
        }

        let ret = f();
        fence(Ordering::SeqCst);
        self.release();
        trace!("[HK] shootdown {}: done", generation);
        Ok(ret)
    }

    fn release(&self) {
        self.active.store(0, Ordering::Release);
        self.lock.store(false, Ordering::Release);
    }

    /// Called by the shootdown IPI handler of every other core.
    pub fn wait(&self) {
        let Some(generation) = self.generation() else {
            return;
        };
        if !self.acknowledge(generation) {
            return;
        }
        while self.active.load(Ordering::Acquire) == generation {
            core::hint::spin_loop();
        }
    }
}
