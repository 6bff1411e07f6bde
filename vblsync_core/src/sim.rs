// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Deterministic simulated display for tests and demos.
//!
//! [`SimDisplay`] models a display with a fixed refresh period, a scanning
//! beam and a blanking interrupt, driven by a fake nanosecond clock. One
//! handle implements every platform trait ([`SwapAdapter`],
//! [`DrawingTarget`], [`GraphicsContext`], [`Clock`] and [`WaitStrategy`]);
//! clones share the same state, so [`SimDisplay::binding`] hands boxed clones
//! to an engine while the test keeps its own handle to inspect and inject
//! faults.
//!
//! # Model
//!
//! - Blank `k` starts at `phase + k * period`; the blanking count at time
//!   `t` is the number of the last blank that started at or before `t`.
//! - At the start of a blank the beam is at the first blanking line
//!   (`visible_lines`); it advances one line every
//!   `period / total_lines` and wraps to line 0.
//! - An unscheduled swap lands on the first blank strictly after it was
//!   issued; a scheduled swap on its target blank (or the next possible
//!   one). [`SimFaults::late_frames`] delays every landing.
//! - Waiting advances the fake clock. Only [`SimFaults::real_stall`] and
//!   [`SimFaults::stuck_sync_token`] cost wall-clock time; the first is
//!   interruptible through the abort token, the second is not.

use core::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::adapter::{
    AdapterCaps, BlankingSample, BufferKind, DrawingTarget, GraphicsContext, PlatformBinding,
    ScheduleTarget, SwapAdapter, SwapCompletion, SwapId, SwapKind,
};
use crate::context::SharedConnection;
use crate::error::{AdapterError, FlipError};
use crate::time::{HostTime, Timebase};
use crate::timing::{ClearMode, Eye, Periodicity};
use crate::wait::{AbortToken, Clock, WaitStrategy};

/// Static properties of the simulated display.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SimConfig {
    /// Refresh period in nanoseconds.
    pub period_ns: u64,
    /// Start time of blank 0 in nanoseconds.
    pub phase_ns: u64,
    /// Clock value at creation in nanoseconds.
    pub start_ns: u64,
    /// Visible scanlines; blanking starts here.
    pub visible_lines: u32,
    /// Total scanlines per frame.
    pub total_lines: u32,
    /// Whether scheduled swaps and completion waits are supported.
    pub scheduled_swap: bool,
    /// Whether the blanking counter can be queried.
    pub blanking_query: bool,
    /// Whether the beam position can be queried.
    pub beam_position: bool,
    /// Whether swaps are pageflips.
    pub pageflip: bool,
    /// Whether the nominal refresh interval is reported.
    pub report_nominal: bool,
    /// Buffer configuration of the drawing target.
    pub buffer_kind: BufferKind,
    /// Delay between a swap landing and its completion being observed.
    pub completion_latency_ns: u64,
    /// Delay between a wait's deadline and the waiter resuming.
    pub wake_latency_ns: u64,
    /// Upper bound of deterministic jitter added to latencies.
    pub jitter_ns: u64,
    /// Fake time consumed by one busy-poll iteration.
    pub spin_step_ns: u64,
    /// Seed of the jitter generator.
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            period_ns: 16_666_667,
            phase_ns: 0,
            start_ns: 1_000_000_000,
            visible_lines: 1080,
            total_lines: 1125,
            scheduled_swap: true,
            blanking_query: true,
            beam_position: true,
            pageflip: true,
            report_nominal: false,
            buffer_kind: BufferKind::Double,
            completion_latency_ns: 50_000,
            wake_latency_ns: 20_000,
            jitter_ns: 0,
            spin_step_ns: 5_000,
            seed: 0x5eed,
        }
    }
}

/// Faults that can be switched on while a test runs.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SimFaults {
    /// Every swap lands this many blanks later than it should.
    pub late_frames: u32,
    /// Only the next swap lands this many blanks late.
    pub late_once: u32,
    /// The beam position is stuck at this line.
    pub frozen_beam: Option<u32>,
    /// Offset added to blanking-interrupt timestamps, in nanoseconds.
    pub irq_offset_ns: i64,
    /// Offset added to scheduled completion timestamps, in nanoseconds.
    pub completion_offset_ns: i64,
    /// The sync token returns without waiting for the swap.
    pub fall_through: bool,
    /// Scheduled swaps report unsupported even if the config allows them.
    pub scheduling_unsupported: bool,
    /// The next wait additionally blocks for this much wall-clock time.
    pub real_stall: Option<std::time::Duration>,
    /// The next sync token blocks for this much wall-clock time and ignores
    /// aborts, like a call stuck in the driver.
    pub stuck_sync_token: Option<std::time::Duration>,
}

/// One swap as the simulated display saw it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimSwap {
    /// When the swap was issued.
    pub issued_at: HostTime,
    /// Blanking count it landed on (or the count at issue if unsynced).
    pub count: u64,
    /// When it took effect.
    pub landed_at: HostTime,
    /// Whether it came through the scheduled path.
    pub scheduled: bool,
}

#[derive(Debug)]
struct Pending {
    id: u64,
    swap: SimSwap,
    done: bool,
}

#[derive(Debug)]
struct SimState {
    config: SimConfig,
    faults: SimFaults,
    now_ns: u64,
    sync_to_blank: bool,
    next_id: u64,
    pending: Vec<Pending>,
    log: Vec<SimSwap>,
    eyes: Vec<Eye>,
    clears: Vec<ClearMode>,
    rng: u64,
    context_binds: u32,
}

impl SimState {
    fn line_ns(&self) -> f64 {
        self.config.period_ns as f64 / f64::from(self.config.total_lines)
    }

    fn count_at(&self, t_ns: u64) -> u64 {
        t_ns.saturating_sub(self.config.phase_ns) / self.config.period_ns
    }

    fn blank_start(&self, count: u64) -> u64 {
        self.config.phase_ns + count * self.config.period_ns
    }

    #[expect(
        clippy::cast_possible_truncation,
        reason = "line offsets are below total_lines"
    )]
    fn beam_at(&self, t_ns: u64) -> u32 {
        let since = t_ns - self.blank_start(self.count_at(t_ns));
        let lines = (since as f64 / self.line_ns()) as u32;
        (self.config.visible_lines + lines) % self.config.total_lines
    }

    fn jitter(&mut self) -> u64 {
        if self.config.jitter_ns == 0 {
            return 0;
        }
        // 64-bit LCG (Knuth MMIX constants).
        self.rng = self
            .rng
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (self.rng >> 33) % (self.config.jitter_ns + 1)
    }

    fn late_frames(&mut self) -> u64 {
        let once = core::mem::take(&mut self.faults.late_once);
        u64::from(self.faults.late_frames + once)
    }

    fn queue(&mut self, count: u64, scheduled: bool) -> u64 {
        let count = count + self.late_frames();
        let id = self.next_id;
        self.next_id += 1;
        let swap = SimSwap {
            issued_at: HostTime(self.now_ns),
            count,
            landed_at: HostTime(self.blank_start(count)),
            scheduled,
        };
        self.pending.push(Pending {
            id,
            swap,
            done: false,
        });
        id
    }

    fn complete(&mut self, index: usize) -> SimSwap {
        let swap = self.pending[index].swap;
        self.pending[index].done = true;
        let jitter = self.jitter();
        let latency = self.config.completion_latency_ns + jitter;
        self.now_ns = self.now_ns.max(swap.landed_at.0) + latency;
        self.log.push(swap);
        self.pending.retain(|p| !p.done);
        swap
    }
}

fn offset(t: HostTime, ns: i64) -> HostTime {
    HostTime(t.0.saturating_add_signed(ns))
}

/// Handle to a simulated display. Clones share state.
#[derive(Clone)]
pub struct SimDisplay {
    state: Arc<Mutex<SimState>>,
}

impl fmt::Debug for SimDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimDisplay")
            .field("now_ns", &state.now_ns)
            .field("swaps", &state.log.len())
            .field("faults", &state.faults)
            .finish_non_exhaustive()
    }
}

impl SimDisplay {
    /// Creates a display at `config.start_ns`.
    #[must_use]
    pub fn new(config: SimConfig) -> Self {
        let state = SimState {
            config,
            faults: SimFaults::default(),
            now_ns: config.start_ns,
            sync_to_blank: true,
            next_id: 1,
            pending: Vec::new(),
            log: Vec::new(),
            eyes: Vec::new(),
            clears: Vec::new(),
            rng: config.seed,
            context_binds: 0,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// A binding whose every collaborator is this display.
    #[must_use]
    pub fn binding(&self) -> PlatformBinding {
        PlatformBinding {
            adapter: Box::new(self.clone()),
            target: Box::new(self.clone()),
            clock: Arc::new(self.clone()),
            waiter: Box::new(self.clone()),
            worker_context: Some(Box::new(self.clone())),
            connection: None,
        }
    }

    /// Like [`binding`](Self::binding), sharing a display connection lock.
    #[must_use]
    pub fn binding_with_connection(&self, connection: SharedConnection) -> PlatformBinding {
        PlatformBinding {
            connection: Some(connection),
            ..self.binding()
        }
    }

    /// The display's configuration.
    #[must_use]
    pub fn config(&self) -> SimConfig {
        self.state.lock().config
    }

    /// Refresh period in seconds.
    #[must_use]
    pub fn period_secs(&self) -> f64 {
        self.state.lock().config.period_ns as f64 * 1e-9
    }

    /// Current fake time.
    #[must_use]
    pub fn now(&self) -> HostTime {
        HostTime(self.state.lock().now_ns)
    }

    /// Advances the fake clock.
    pub fn advance_ns(&self, ns: u64) {
        self.state.lock().now_ns += ns;
    }

    /// Start time of blank `count`.
    #[must_use]
    pub fn blank_time(&self, count: u64) -> HostTime {
        HostTime(self.state.lock().blank_start(count))
    }

    /// Blanking count at time `t`.
    #[must_use]
    pub fn count_at(&self, t: HostTime) -> u64 {
        self.state.lock().count_at(t.0)
    }

    /// Mutates the active faults.
    pub fn with_faults(&self, f: impl FnOnce(&mut SimFaults)) {
        f(&mut self.state.lock().faults);
    }

    /// Every completed swap so far.
    #[must_use]
    pub fn swap_log(&self) -> Vec<SimSwap> {
        self.state.lock().log.clone()
    }

    /// Eyes presented through [`DrawingTarget::present_eye`], in order.
    #[must_use]
    pub fn presented_eyes(&self) -> Vec<Eye> {
        self.state.lock().eyes.clone()
    }

    /// Clear modes applied after swaps, in order.
    #[must_use]
    pub fn applied_clears(&self) -> Vec<ClearMode> {
        self.state.lock().clears.clone()
    }

    /// How many times the worker context was bound.
    #[must_use]
    pub fn context_binds(&self) -> u32 {
        self.state.lock().context_binds
    }

    /// Whether swaps are currently synchronized to the blank.
    #[must_use]
    pub fn sync_to_blank(&self) -> bool {
        self.state.lock().sync_to_blank
    }
}

impl Clock for SimDisplay {
    fn now(&self) -> HostTime {
        HostTime(self.state.lock().now_ns)
    }

    fn timebase(&self) -> Timebase {
        Timebase::NANOS
    }
}

impl WaitStrategy for SimDisplay {
    fn wait_until(
        &mut self,
        clock: &dyn Clock,
        deadline: HostTime,
        abort: &AbortToken,
    ) -> Result<(), FlipError> {
        _ = clock;
        abort.check()?;
        let stall = self.state.lock().faults.real_stall.take();
        if let Some(stall) = stall {
            let until = std::time::Instant::now() + stall;
            while std::time::Instant::now() < until {
                abort.check()?;
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        }
        let mut state = self.state.lock();
        if deadline.0 > state.now_ns {
            let jitter = state.jitter();
            let wake = state.config.wake_latency_ns;
            state.now_ns = deadline.0 + wake + jitter;
        }
        Ok(())
    }

    fn pause(&mut self, clock: &dyn Clock, secs: f64) {
        _ = clock;
        let ns = Timebase::NANOS.secs_to_ticks(secs);
        self.state.lock().now_ns += ns;
    }

    fn spin(&mut self, clock: &dyn Clock) {
        _ = clock;
        let mut state = self.state.lock();
        let step = state.config.spin_step_ns;
        state.now_ns += step;
    }
}

impl SwapAdapter for SimDisplay {
    fn capabilities(&self) -> AdapterCaps {
        let state = self.state.lock();
        AdapterCaps {
            scheduled_swap: state.config.scheduled_swap,
            completion_wait: state.config.scheduled_swap,
            blanking_query: state.config.blanking_query,
            beam_position: state.config.beam_position,
        }
    }

    fn schedule_swap(
        &mut self,
        target: ScheduleTarget,
        constraint: Option<Periodicity>,
    ) -> Result<SwapId, AdapterError> {
        let mut state = self.state.lock();
        if !state.config.scheduled_swap || state.faults.scheduling_unsupported {
            return Err(AdapterError::Unsupported);
        }
        let next = state.count_at(state.now_ns) + 1;
        let mut count = match target {
            ScheduleTarget::NextVblank => next,
            ScheduleTarget::Time(t) => (state.count_at(t.0) + 1).max(next),
            ScheduleTarget::Count(n) => n.max(next),
        };
        if let Some(p) = constraint {
            if p.divisor == 0 {
                return Err(AdapterError::Failed("zero divisor".into()));
            }
            while !p.admits(count) {
                count += 1;
            }
        }
        Ok(SwapId(state.queue(count, true)))
    }

    fn wait_for_swap_completion(&mut self, id: SwapId) -> Result<SwapCompletion, AdapterError> {
        let mut state = self.state.lock();
        let Some(index) = state.pending.iter().position(|p| p.id == id.0) else {
            return Err(AdapterError::Failed(format!("unknown swap {}", id.0)));
        };
        let offset_ns = state.faults.completion_offset_ns;
        let swap = state.complete(index);
        Ok(SwapCompletion {
            timestamp: offset(swap.landed_at, offset_ns),
            vblank_count: swap.count,
        })
    }

    fn query_blanking(&mut self) -> Result<BlankingSample, AdapterError> {
        let state = self.state.lock();
        if !state.config.blanking_query {
            return Err(AdapterError::Unsupported);
        }
        let count = state.count_at(state.now_ns);
        Ok(BlankingSample {
            count,
            timestamp: offset(HostTime(state.blank_start(count)), state.faults.irq_offset_ns),
        })
    }

    fn beam_position(&mut self) -> Option<u32> {
        let state = self.state.lock();
        if !state.config.beam_position {
            return None;
        }
        Some(
            state
                .faults
                .frozen_beam
                .unwrap_or_else(|| state.beam_at(state.now_ns)),
        )
    }

    fn flip_buffers(&mut self) -> Result<(), AdapterError> {
        let mut state = self.state.lock();
        if state.sync_to_blank {
            let next = state.count_at(state.now_ns) + 1;
            state.queue(next, false);
        } else {
            let now = HostTime(state.now_ns);
            let count = state.count_at(now.0);
            state.log.push(SimSwap {
                issued_at: now,
                count,
                landed_at: now,
                scheduled: false,
            });
        }
        Ok(())
    }

    fn set_sync_to_blanking(&mut self, enabled: bool) -> Result<(), AdapterError> {
        self.state.lock().sync_to_blank = enabled;
        Ok(())
    }

    fn visible_lines(&self) -> Option<u32> {
        let state = self.state.lock();
        state.config.beam_position.then_some(state.config.visible_lines)
    }

    fn last_swap_kind(&self) -> SwapKind {
        if self.state.lock().config.pageflip {
            SwapKind::Pageflip
        } else {
            SwapKind::Copy
        }
    }

    fn nominal_interval_secs(&self) -> Option<f64> {
        let state = self.state.lock();
        state
            .config
            .report_nominal
            .then(|| state.config.period_ns as f64 * 1e-9)
    }
}

impl DrawingTarget for SimDisplay {
    fn detach(&mut self) {}

    fn reattach(&mut self) {}

    fn flush(&mut self) {}

    fn buffer_kind(&self) -> BufferKind {
        self.state.lock().config.buffer_kind
    }

    fn finish_with_sync_token(&mut self) -> Result<(), AdapterError> {
        let stuck = self.state.lock().faults.stuck_sync_token.take();
        if let Some(stuck) = stuck {
            std::thread::sleep(stuck);
        }
        let mut state = self.state.lock();
        if state.faults.fall_through {
            state.now_ns += 10_000;
            return Ok(());
        }
        match state.pending.iter().rposition(|p| !p.swap.scheduled) {
            Some(index) => {
                state.complete(index);
            }
            None => {
                let jitter = state.jitter();
                let latency = state.config.completion_latency_ns;
                state.now_ns += latency + jitter;
            }
        }
        Ok(())
    }

    fn apply_clear(&mut self, mode: ClearMode) {
        self.state.lock().clears.push(mode);
    }

    fn present_eye(&mut self, eye: Eye) -> Result<(), AdapterError> {
        self.state.lock().eyes.push(eye);
        Ok(())
    }
}

impl GraphicsContext for SimDisplay {
    fn make_current(&mut self) -> Result<(), AdapterError> {
        self.state.lock().context_binds += 1;
        Ok(())
    }

    fn release(&mut self) -> Result<(), AdapterError> {
        Ok(())
    }
}
