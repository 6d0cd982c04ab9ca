// =============================================================================
// Incremental State Cache — per-session, per-track recurrent state
// =============================================================================
//
// State machine per (session, track):
//
//   Uninitialized --initialize(history)--> Warm
//   Warm          --advance(bar)---------> Warm     (one encoder step)
//   Warm          --reset / stale gap----> Uninitialized
//
// A Warm track keeps its recurrent state, a fixed ring of the last `L_track`
// hidden outputs and the pooled summary of that ring. `advance` runs one
// encoder step, pools the rotated window in a per-track workspace and writes
// the new step into the ring slot; it never re-runs the recurrence over the
// window. Tracks without a new bar keep everything untouched.
//
// Locking: the session map sits behind a `RwLock`; each session has its own
// `Mutex`, so different sessions proceed in parallel while calls against one
// session are serialized. Only the new recurrent state, hidden step and
// pooled summary are staged; they are committed when every track succeeded,
// so a failed call leaves the session as it was.

pub mod ring;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3, Axis};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, trace};

use crate::error::{EngineError, EngineResult};
use crate::model::lstm::RecurrentState;
use crate::model::pooling::PoolOutput;
use crate::model::FusionModel;
use crate::types::{SessionId, TrackId, TrackMap};

use self::ring::HiddenRing;

/// Everything a Warm track carries between calls.
#[derive(Debug, Clone)]
pub struct WarmTrack {
    pub recurrent: RecurrentState,
    pub ring: HiddenRing,
    pub pooled: PoolOutput,
    /// Bars consumed since initialization, warm-up history included.
    pub steps_seen: u64,
    pub last_bar_at: DateTime<Utc>,
    /// Scratch `[B, L, D]` for decaying and pooling; not part of the state.
    workspace: Array3<f64>,
}

impl PartialEq for WarmTrack {
    fn eq(&self, other: &Self) -> bool {
        self.recurrent == other.recurrent
            && self.ring == other.ring
            && self.pooled == other.pooled
            && self.steps_seen == other.steps_seen
            && self.last_bar_at == other.last_bar_at
    }
}

/// Result of one encoder step, held until every track of the call succeeded.
struct StagedStep {
    track: TrackId,
    recurrent: RecurrentState,
    hidden: Array2<f64>,
    pooled: PoolOutput,
}

impl WarmTrack {
    fn commit(&mut self, step: StagedStep, at: DateTime<Utc>) -> EngineResult<()> {
        self.ring.push(step.hidden.view())?;
        self.recurrent = step.recurrent;
        self.pooled = step.pooled;
        self.steps_seen += 1;
        self.last_bar_at = at;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum TrackSlot {
    #[default]
    Uninitialized,
    Warm(WarmTrack),
}

impl TrackSlot {
    pub fn is_warm(&self) -> bool {
        matches!(self, Self::Warm(_))
    }
}

#[derive(Debug, Clone)]
pub struct SessionState {
    id: SessionId,
    tracks: TrackMap<TrackSlot>,
    batch: usize,
    /// Timestamp of the last successful initialize or advance.
    last_update: Option<DateTime<Utc>>,
    /// Last time any call touched the session; drives idle eviction.
    touched_at: DateTime<Utc>,
}

impl SessionState {
    fn new(id: SessionId, at: DateTime<Utc>) -> Self {
        Self {
            id,
            tracks: TrackMap::from_fn(|_| TrackSlot::Uninitialized),
            batch: 0,
            last_update: None,
            touched_at: at,
        }
    }

    pub fn tracks(&self) -> &TrackMap<TrackSlot> {
        &self.tracks
    }

    fn reset(&mut self) {
        for (_, slot) in self.tracks.iter_mut() {
            *slot = TrackSlot::Uninitialized;
        }
        self.last_update = None;
    }

    fn pooled(&self) -> EngineResult<TrackMap<PoolOutput>> {
        TrackMap::try_from_fn(|track| match &self.tracks[track] {
            TrackSlot::Warm(warm) => Ok(warm.pooled.clone()),
            TrackSlot::Uninitialized => Err(EngineError::Uninitialized {
                session: self.id.clone(),
                track,
            }),
        })
    }
}

/// Serializable view of one session for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub batch: usize,
    pub last_update: Option<DateTime<Utc>>,
    pub tracks: TrackMap<TrackStatus>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TrackStatus {
    pub warm: bool,
    pub steps_seen: u64,
    pub buffered: usize,
    pub last_bar_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// StateCache
// ---------------------------------------------------------------------------

pub struct StateCache {
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<SessionState>>>>,
    staleness: Duration,
}

impl StateCache {
    pub fn new(staleness_threshold_secs: u64) -> Self {
        let secs = i64::try_from(staleness_threshold_secs).unwrap_or(i64::MAX);
        Self {
            sessions: RwLock::new(HashMap::new()),
            staleness: Duration::try_seconds(secs).unwrap_or(Duration::MAX),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    fn handle(&self, id: &str) -> Option<Arc<Mutex<SessionState>>> {
        self.sessions.read().get(id).cloned()
    }

    /// Warm every track from its history `[B, T, F]` with `T >= L_track`,
    /// replacing whatever the session held before. Returns the pooled
    /// summaries for the initializing prediction.
    pub fn initialize(
        &self,
        model: &FusionModel,
        id: &str,
        histories: TrackMap<ArrayView3<f64>>,
        at: DateTime<Utc>,
    ) -> EngineResult<TrackMap<PoolOutput>> {
        let batch = histories[TrackId::M1].len_of(Axis(0));
        let staged = TrackMap::try_from_fn(|track| {
            let history = histories[track];
            if history.len_of(Axis(0)) != batch {
                return Err(EngineError::shape(
                    format!("{track} batch size"),
                    batch,
                    history.len_of(Axis(0)),
                ));
            }
            warm_up(model, track, history, at)
        })?;

        let handle = {
            let mut sessions = self.sessions.write();
            sessions
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(SessionState::new(id.to_string(), at))))
                .clone()
        };
        let mut session = handle.lock();
        session.tracks = staged.map(|_, warm| TrackSlot::Warm(warm));
        session.batch = batch;
        session.last_update = Some(at);
        session.touched_at = at;

        info!(session = %id, batch, "session initialized");
        session.pooled()
    }

    /// Feed the new bars of one time step. Tracks mapped to `None` reuse
    /// their cached pooled summary.
    pub fn advance(
        &self,
        model: &FusionModel,
        id: &str,
        bars: TrackMap<Option<ArrayView2<f64>>>,
        at: DateTime<Utc>,
    ) -> EngineResult<TrackMap<PoolOutput>> {
        if bars.values().all(Option::is_none) {
            return Err(EngineError::EmptyAdvance {
                session: id.to_string(),
            });
        }
        let Some(handle) = self.handle(id) else {
            let track = bars
                .iter()
                .find(|(_, bar)| bar.is_some())
                .map_or(TrackId::M1, |(track, _)| track);
            return Err(EngineError::Uninitialized {
                session: id.to_string(),
                track,
            });
        };

        let mut session = handle.lock();
        session.touched_at = session.touched_at.max(at);
        self.check_clock(&mut session, at)?;

        let mut staged: Vec<StagedStep> = Vec::new();
        for (track, slot) in session.tracks.iter_mut() {
            let warm = match slot {
                TrackSlot::Warm(warm) => warm,
                TrackSlot::Uninitialized => {
                    return Err(EngineError::Uninitialized {
                        session: id.to_string(),
                        track,
                    })
                }
            };
            if let Some(bar) = bars[track] {
                staged.push(stage_step(model, track, warm, bar)?);
            }
        }

        for step in staged {
            let track = step.track;
            if let TrackSlot::Warm(warm) = &mut session.tracks[track] {
                warm.commit(step, at)?;
                trace!(session = %id, %track, steps_seen = warm.steps_seen, "track advanced");
            }
        }
        session.last_update = Some(at);
        debug!(session = %id, "session advanced");
        session.pooled()
    }

    /// Reject out-of-order updates; reset and reject after a stale gap.
    fn check_clock(&self, session: &mut SessionState, at: DateTime<Utc>) -> EngineResult<()> {
        let Some(last) = session.last_update else {
            return Ok(());
        };
        if at < last {
            return Err(EngineError::OutOfOrder {
                session: session.id.clone(),
                behind_secs: (last - at).num_seconds(),
            });
        }
        let gap = at - last;
        if gap > self.staleness {
            session.reset();
            info!(
                session = %session.id,
                gap_secs = gap.num_seconds(),
                "stale session reset"
            );
            return Err(EngineError::StaleSession {
                session: session.id.clone(),
                gap_secs: gap.num_seconds(),
                threshold_secs: self.staleness.num_seconds().max(0) as u64,
            });
        }
        Ok(())
    }

    /// Return every track of the session to Uninitialized. `false` when the
    /// session is unknown.
    pub fn reset(&self, id: &str) -> bool {
        match self.handle(id) {
            Some(handle) => {
                handle.lock().reset();
                info!(session = %id, "session reset");
                true
            }
            None => false,
        }
    }

    /// Drop sessions idle for longer than the staleness threshold. A session
    /// whose lock is held is mid-call and therefore not idle; it is skipped
    /// without waiting, and no session lock is taken under the map lock.
    pub fn evict_idle(&self, now: DateTime<Utc>) -> Vec<SessionId> {
        let handles: Vec<(SessionId, Arc<Mutex<SessionState>>)> = self
            .sessions
            .read()
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect();

        let idle: Vec<(SessionId, Arc<Mutex<SessionState>>)> = handles
            .into_iter()
            .filter(|(_, handle)| {
                handle
                    .try_lock()
                    .is_some_and(|session| now - session.touched_at > self.staleness)
            })
            .collect();
        if idle.is_empty() {
            return Vec::new();
        }

        let mut sessions = self.sessions.write();
        let mut evicted = Vec::new();
        for (id, handle) in idle {
            // Re-initialized under the same id since the scan: keep it.
            if sessions.get(&id).is_some_and(|current| Arc::ptr_eq(current, &handle)) {
                sessions.remove(&id);
                evicted.push(id);
            }
        }
        if !evicted.is_empty() {
            info!(count = evicted.len(), "idle sessions evicted");
        }
        evicted
    }

    pub fn snapshot(&self, id: &str) -> Option<SessionSnapshot> {
        let handle = self.handle(id)?;
        let session = handle.lock();
        Some(SessionSnapshot {
            session_id: session.id.clone(),
            batch: session.batch,
            last_update: session.last_update,
            tracks: session.tracks.as_ref().map(|_, slot| match slot {
                TrackSlot::Warm(warm) => TrackStatus {
                    warm: true,
                    steps_seen: warm.steps_seen,
                    buffered: warm.ring.len(),
                    last_bar_at: Some(warm.last_bar_at),
                },
                TrackSlot::Uninitialized => TrackStatus {
                    warm: false,
                    steps_seen: 0,
                    buffered: 0,
                    last_bar_at: None,
                },
            }),
        })
    }

    /// Copy of one track's slot, for inspection.
    pub fn track_slot(&self, id: &str, track: TrackId) -> Option<TrackSlot> {
        let handle = self.handle(id)?;
        let slot = handle.lock().tracks[track].clone();
        Some(slot)
    }
}

/// Run the recurrence over a whole history and keep its trailing window.
fn warm_up(
    model: &FusionModel,
    track: TrackId,
    history: ArrayView3<f64>,
    at: DateTime<Utc>,
) -> EngineResult<WarmTrack> {
    let encoder = model.encoder(track);
    let (batch, len, _) = history.dim();
    if len < encoder.window_len() {
        return Err(EngineError::shape(
            format!("{track} history length"),
            format!(">= {}", encoder.window_len()),
            len,
        ));
    }
    let window_len = encoder.window_len();
    let mut recurrent = encoder.zero_state(batch);
    let hidden = encoder.run(history, &mut recurrent)?;
    let ring = HiddenRing::from_trailing(hidden.view(), window_len)?;
    let mut workspace = hidden.slice(s![.., len - window_len.., ..]).to_owned();
    let pooled = model.summarize_in_place(track, &mut workspace)?;
    Ok(WarmTrack {
        recurrent,
        ring,
        pooled,
        steps_seen: len as u64,
        last_bar_at: at,
        workspace,
    })
}

/// One new bar through a Warm track. Only the workspace is written; the
/// ring and recurrent state change at commit.
fn stage_step(
    model: &FusionModel,
    track: TrackId,
    warm: &mut WarmTrack,
    bar: ArrayView2<f64>,
) -> EngineResult<StagedStep> {
    let mut recurrent = warm.recurrent.clone();
    let hidden = model.encoder(track).step(bar, &mut recurrent)?;
    warm.ring.window_after(hidden.view(), &mut warm.workspace)?;
    let pooled = model.summarize_in_place(track, &mut warm.workspace)?;
    Ok(StagedStep {
        track,
        recurrent,
        hidden,
        pooled,
    })
}
