// Cziczere Sync Engine: Snapshot Selectors
//
// Pure read-side derivations. Nothing here is cached; callers recompute
// from whichever snapshot they hold.

use super::ApplicationSnapshot;
use crate::atoms::constants::{ATMOSPHERE_TTL_SECS, TRACKED_EMOTIONS};
use crate::atoms::types::MemoryRecord;
use serde::Serialize;

/// Window size on each side of the trend comparison.
const TREND_WINDOW: usize = 5;
/// Minimum change in mean intensity that counts as a trend.
const TREND_THRESHOLD: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmotionTrend {
    pub emotion: &'static str,
    pub average: f64,
    pub trend: Trend,
    pub count: usize,
}

/// The `n` newest memories.
pub fn recent_memories(snapshot: &ApplicationSnapshot, n: usize) -> &[MemoryRecord] {
    &snapshot.memories[..n.min(snapshot.memories.len())]
}

/// Average, count and direction for each tracked emotion.
///
/// Values are taken oldest to newest; the trend compares the mean of the
/// last `TREND_WINDOW` values to the mean of the window before it.
pub fn emotional_trends(snapshot: &ApplicationSnapshot) -> Vec<EmotionTrend> {
    TRACKED_EMOTIONS
        .iter()
        .map(|&emotion| {
            let values: Vec<f64> = snapshot
                .memories
                .iter()
                .rev()
                .filter_map(|m| m.emotions.get(emotion).copied())
                .collect();
            let count = values.len();
            let average = if count == 0 { 0.0 } else { values.iter().sum::<f64>() / count as f64 };
            EmotionTrend { emotion, average, trend: trend_of(&values), count }
        })
        .collect()
}

fn trend_of(values: &[f64]) -> Trend {
    if values.len() < TREND_WINDOW * 2 {
        return Trend::Stable;
    }
    let n = values.len();
    let mean = |s: &[f64]| s.iter().sum::<f64>() / s.len() as f64;
    let recent = mean(&values[n - TREND_WINDOW..]);
    let previous = mean(&values[n - 2 * TREND_WINDOW..n - TREND_WINDOW]);
    let delta = recent - previous;
    if delta > TREND_THRESHOLD {
        Trend::Increasing
    } else if delta < -TREND_THRESHOLD {
        Trend::Decreasing
    } else {
        Trend::Stable
    }
}

/// Mood label: the cached atmosphere's mood when present, otherwise the
/// emotion with the highest average over the most recent memories.
pub fn dominant_mood(snapshot: &ApplicationSnapshot) -> String {
    if let Some(atmosphere) = snapshot.atmosphere.as_ref().filter(|a| !a.mood.is_empty()) {
        return atmosphere.mood.clone();
    }
    emotional_trends(snapshot)
        .into_iter()
        .filter(|t| t.count > 0)
        .max_by(|a, b| a.average.total_cmp(&b.average))
        .map(|t| t.emotion.to_string())
        .unwrap_or_else(|| "neutral".to_string())
}

/// True when there is no atmosphere or it was refreshed more than the TTL ago.
pub fn atmosphere_is_stale(snapshot: &ApplicationSnapshot, now_ms: i64) -> bool {
    match snapshot.atmosphere_refreshed_at {
        Some(at) if snapshot.atmosphere.is_some() => now_ms - at >= ATMOSPHERE_TTL_SECS * 1000,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{AtmosphereData, UserId};

    fn with_joy(values: &[f64]) -> ApplicationSnapshot {
        let mut snap = ApplicationSnapshot::default();
        // newest first: values are given oldest → newest
        for (i, v) in values.iter().enumerate().rev() {
            let mut m = MemoryRecord::draft(UserId::new("u1"), "m", i as i64);
            m.id = Some(format!("m{}", i));
            m.emotions.insert("joy".into(), *v);
            snap.memories.push(m);
        }
        snap
    }

    #[test]
    fn rising_joy_is_increasing() {
        let snap = with_joy(&[0.1, 0.1, 0.1, 0.1, 0.1, 0.8, 0.8, 0.8, 0.8, 0.8]);
        let joy = emotional_trends(&snap).into_iter().find(|t| t.emotion == "joy").unwrap();
        assert_eq!(joy.trend, Trend::Increasing);
        assert_eq!(joy.count, 10);
        assert!((joy.average - 0.45).abs() < 1e-9);
    }

    #[test]
    fn short_series_is_stable() {
        let snap = with_joy(&[0.9, 0.1]);
        let joy = emotional_trends(&snap).into_iter().find(|t| t.emotion == "joy").unwrap();
        assert_eq!(joy.trend, Trend::Stable);
    }

    #[test]
    fn dominant_mood_prefers_atmosphere() {
        let mut snap = with_joy(&[0.5]);
        assert_eq!(dominant_mood(&snap), "joy");
        snap.atmosphere = Some(AtmosphereData { mood: "calm".into(), ..Default::default() });
        assert_eq!(dominant_mood(&snap), "calm");
        assert_eq!(dominant_mood(&ApplicationSnapshot::default()), "neutral");
    }

    #[test]
    fn atmosphere_staleness() {
        let mut snap = ApplicationSnapshot::default();
        assert!(atmosphere_is_stale(&snap, 0));
        snap.atmosphere = Some(AtmosphereData { mood: "calm".into(), ..Default::default() });
        snap.atmosphere_refreshed_at = Some(1_000);
        assert!(!atmosphere_is_stale(&snap, 1_000 + 60_000));
        assert!(atmosphere_is_stale(&snap, 1_000 + 300_000));
    }

    #[test]
    fn recent_memories_clamps() {
        let snap = with_joy(&[0.1, 0.2, 0.3]);
        assert_eq!(recent_memories(&snap, 2).len(), 2);
        assert_eq!(recent_memories(&snap, 10).len(), 3);
        assert_eq!(recent_memories(&snap, 1)[0].id.as_deref(), Some("m2"));
    }
}
