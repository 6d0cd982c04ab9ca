// =============================================================================
// Shared types used across the Aurora fusion engine
// =============================================================================

use std::ops::{Index, IndexMut};

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

/// Number of resolution tracks. Fixed, independent of which tracks they are.
pub const TRACK_COUNT: usize = 5;

/// Opaque caller-chosen session identifier (one per trading instance).
pub type SessionId = String;

/// One of the five fixed time resolutions feeding the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrackId {
    M1,
    M5,
    M15,
    H1,
    H4,
}

impl TrackId {
    /// All tracks in canonical (fastest-first) order.
    pub const ALL: [TrackId; TRACK_COUNT] = [
        TrackId::M1,
        TrackId::M5,
        TrackId::M15,
        TrackId::H1,
        TrackId::H4,
    ];

    /// Position of this track in the canonical order.
    pub const fn index(self) -> usize {
        match self {
            Self::M1 => 0,
            Self::M5 => 1,
            Self::M15 => 2,
            Self::H1 => 3,
            Self::H4 => 4,
        }
    }

    /// Bar sampling period in seconds.
    pub const fn period_secs(self) -> u64 {
        match self {
            Self::M1 => 60,
            Self::M5 => 300,
            Self::M15 => 900,
            Self::H1 => 3_600,
            Self::H4 => 14_400,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "M1",
            Self::M5 => "M5",
            Self::M15 => "M15",
            Self::H1 => "H1",
            Self::H4 => "H4",
        }
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// TrackMap — one value per track, indexed by TrackId
// =============================================================================

/// Fixed-size per-track container. Always holds exactly one entry per track,
/// so "missing track" is unrepresentable once a value has been built.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackMap<T>([T; TRACK_COUNT]);

impl<T> TrackMap<T> {
    pub fn from_fn(mut f: impl FnMut(TrackId) -> T) -> Self {
        Self(TrackId::ALL.map(&mut f))
    }

    /// Build a map from a fallible constructor, stopping at the first error.
    pub fn try_from_fn<E>(mut f: impl FnMut(TrackId) -> Result<T, E>) -> Result<Self, E> {
        let mut values = Vec::with_capacity(TRACK_COUNT);
        for track in TrackId::ALL {
            values.push(f(track)?);
        }
        match values.try_into() {
            Ok(array) => Ok(Self(array)),
            Err(_) => unreachable!("exactly TRACK_COUNT values were pushed"),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (TrackId, &T)> {
        TrackId::ALL.into_iter().zip(self.0.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (TrackId, &mut T)> {
        TrackId::ALL.into_iter().zip(self.0.iter_mut())
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.0.iter()
    }

    pub fn map<U>(self, mut f: impl FnMut(TrackId, T) -> U) -> TrackMap<U> {
        let mut values = self.0.into_iter();
        TrackMap::from_fn(|track| match values.next() {
            Some(value) => f(track, value),
            None => unreachable!("TrackMap always holds TRACK_COUNT values"),
        })
    }

    pub fn as_ref(&self) -> TrackMap<&T> {
        TrackMap(self.0.each_ref())
    }
}

impl<T> Index<TrackId> for TrackMap<T> {
    type Output = T;

    fn index(&self, track: TrackId) -> &T {
        &self.0[track.index()]
    }
}

impl<T> IndexMut<TrackId> for TrackMap<T> {
    fn index_mut(&mut self, track: TrackId) -> &mut T {
        &mut self.0[track.index()]
    }
}

impl<T: Serialize> Serialize for TrackMap<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(TRACK_COUNT))?;
        for (track, value) in self.iter() {
            map.serialize_entry(track.as_str(), value)?;
        }
        map.end()
    }
}

// =============================================================================
// Direction classes
// =============================================================================

/// Three-way price direction. Index order matches the direction head output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DirectionClass {
    Down,
    Neutral,
    Up,
}

impl DirectionClass {
    pub const ALL: [DirectionClass; 3] = [Self::Down, Self::Neutral, Self::Up];

    pub fn from_index(idx: usize) -> Option<Self> {
        Self::ALL.get(idx).copied()
    }
}

impl std::fmt::Display for DirectionClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Down => write!(f, "DOWN"),
            Self::Neutral => write!(f, "NEUTRAL"),
            Self::Up => write!(f, "UP"),
        }
    }
}
