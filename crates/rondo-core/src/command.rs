//! UI → audio thread command channel.
//!
//! Commands are small `Copy` values pushed through a fixed-capacity SPSC ring.
//! The producer never blocks: a full queue drops the newest command and counts
//! it. The consumer drains at the head of every buffer period.

use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Sentinel for "no seek" in [`AudioCommand::sample_pos`].
pub const NO_SEEK: u64 = u64::MAX;

/// Command type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CommandKind {
    #[default]
    None,
    /// `value1 >= 0.5` plays, otherwise stops. `sample_pos` seeks unless [`NO_SEEK`].
    SetTransportState,
    SetTrackVolume,
    /// `value1` in -1..=1.
    SetTrackPan,
    SetTrackMute,
    SetTrackSolo,
    LoadProjectState,
    UpdateClipState,
    StartPreview,
    StopPreview,
}

/// Fixed-size command envelope. Never owns heap data.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[repr(C, align(32))]
pub struct AudioCommand {
    pub kind: CommandKind,
    pub track_index: u32,
    pub value1: f32,
    pub value2: f32,
    pub sample_pos: u64,
    pub payload_index: u32,
}

const _: () = assert!(std::mem::size_of::<AudioCommand>() <= 32);

impl AudioCommand {
    fn track(kind: CommandKind, track_index: u32, value1: f32) -> Self {
        Self {
            kind,
            track_index,
            value1,
            sample_pos: NO_SEEK,
            ..Default::default()
        }
    }

    pub fn set_track_volume(track_index: u32, gain: f32) -> Self {
        Self::track(CommandKind::SetTrackVolume, track_index, gain)
    }

    pub fn set_track_pan(track_index: u32, pan: f32) -> Self {
        Self::track(CommandKind::SetTrackPan, track_index, pan)
    }

    pub fn set_track_mute(track_index: u32, muted: bool) -> Self {
        Self::track(CommandKind::SetTrackMute, track_index, bool_value(muted))
    }

    pub fn set_track_solo(track_index: u32, soloed: bool) -> Self {
        Self::track(CommandKind::SetTrackSolo, track_index, bool_value(soloed))
    }

    pub fn set_transport(playing: bool, seek: Option<u64>) -> Self {
        Self {
            kind: CommandKind::SetTransportState,
            value1: bool_value(playing),
            sample_pos: seek.unwrap_or(NO_SEEK),
            ..Default::default()
        }
    }

    pub fn load_project_state(payload_index: u32) -> Self {
        Self {
            kind: CommandKind::LoadProjectState,
            payload_index,
            sample_pos: NO_SEEK,
            ..Default::default()
        }
    }

    pub fn update_clip_state(track_index: u32, payload_index: u32) -> Self {
        Self {
            kind: CommandKind::UpdateClipState,
            track_index,
            payload_index,
            sample_pos: NO_SEEK,
            ..Default::default()
        }
    }

    pub fn start_preview(payload_index: u32) -> Self {
        Self {
            kind: CommandKind::StartPreview,
            payload_index,
            sample_pos: NO_SEEK,
            ..Default::default()
        }
    }

    pub fn stop_preview() -> Self {
        Self {
            kind: CommandKind::StopPreview,
            sample_pos: NO_SEEK,
            ..Default::default()
        }
    }

    /// `value1` interpreted as a flag.
    #[inline]
    pub fn flag(&self) -> bool {
        self.value1 >= 0.5
    }

    #[inline]
    pub fn seek_target(&self) -> Option<u64> {
        (self.sample_pos != NO_SEEK).then_some(self.sample_pos)
    }
}

#[inline]
fn bool_value(flag: bool) -> f32 {
    if flag {
        1.0
    } else {
        0.0
    }
}

#[derive(Debug, Default)]
struct QueueTelemetry {
    dropped: AtomicU64,
    max_depth: AtomicU32,
}

/// Create a command queue with a fixed capacity.
///
/// All storage is allocated here; neither side allocates afterwards.
pub fn command_queue(capacity: usize) -> (CommandSender, CommandReceiver) {
    let rb = HeapRb::<AudioCommand>::new(capacity.max(1));
    let (prod, cons) = rb.split();
    let telemetry = Arc::new(QueueTelemetry::default());

    (
        CommandSender {
            prod,
            telemetry: Arc::clone(&telemetry),
        },
        CommandReceiver { cons, telemetry },
    )
}

/// Producer half, owned by exactly one control thread.
pub struct CommandSender {
    prod: HeapProd<AudioCommand>,
    telemetry: Arc<QueueTelemetry>,
}

impl CommandSender {
    /// Returns `false` when the queue is full. Never blocks.
    pub fn push(&mut self, cmd: AudioCommand) -> bool {
        if self.prod.try_push(cmd).is_err() {
            self.telemetry.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let depth = self.prod.occupied_len() as u32;
        self.telemetry.max_depth.fetch_max(depth, Ordering::Relaxed);
        true
    }

    pub fn capacity(&self) -> usize {
        self.prod.capacity().get()
    }

    pub fn approx_depth(&self) -> usize {
        self.prod.occupied_len()
    }

    pub fn is_full(&self) -> bool {
        self.prod.is_full()
    }

    pub fn dropped_count(&self) -> u64 {
        self.telemetry.dropped.load(Ordering::Relaxed)
    }

    pub fn max_depth(&self) -> u32 {
        self.telemetry.max_depth.load(Ordering::Relaxed)
    }
}

/// Consumer half, owned by the audio thread.
pub struct CommandReceiver {
    cons: HeapCons<AudioCommand>,
    telemetry: Arc<QueueTelemetry>,
}

impl CommandReceiver {
    #[inline]
    pub fn pop(&mut self) -> Option<AudioCommand> {
        self.cons.try_pop()
    }

    /// Apply every command pending at entry, in FIFO order.
    ///
    /// Commands pushed while draining wait for the next call, so the work per
    /// period is bounded by the queue capacity.
    #[inline]
    pub fn drain(&mut self, mut apply: impl FnMut(AudioCommand)) -> usize {
        let pending = self.cons.occupied_len();
        let mut applied = 0;
        while applied < pending {
            match self.cons.try_pop() {
                Some(cmd) => {
                    apply(cmd);
                    applied += 1;
                }
                None => break,
            }
        }
        applied
    }

    pub fn is_empty(&self) -> bool {
        self.cons.is_empty()
    }

    pub fn dropped_count(&self) -> u64 {
        self.telemetry.dropped.load(Ordering::Relaxed)
    }
}
