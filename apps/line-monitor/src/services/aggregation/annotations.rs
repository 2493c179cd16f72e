use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::services::episodes::AlarmEpisode;

/// Identity of an alarm episode across delete-and-recreate cycles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AnnotationKey {
    pub machine_id: i64,
    pub tag_id: i64,
    pub alarm_code: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl AnnotationKey {
    pub fn of(episode: &AlarmEpisode) -> Self {
        Self {
            machine_id: episode.machine_id,
            tag_id: episode.tag_id,
            alarm_code: episode.alarm_code.clone(),
            start_time: episode.start_time,
            end_time: episode.end_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Annotation {
    reason_id: Option<i64>,
    reason_name: Option<String>,
    note: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AnnotationSnapshot {
    entries: HashMap<AnnotationKey, Annotation>,
}

impl AnnotationSnapshot {
    pub fn from_episodes(episodes: impl IntoIterator<Item = AlarmEpisode>) -> Self {
        let entries = episodes
            .into_iter()
            .filter(AlarmEpisode::has_annotation)
            .map(|episode| {
                (
                    AnnotationKey::of(&episode),
                    Annotation {
                        reason_id: episode.reason_id,
                        reason_name: episode.reason_name,
                        note: episode.note,
                    },
                )
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copies saved annotations onto matching episodes; returns how many matched.
    pub fn restore(&self, episodes: &mut [AlarmEpisode]) -> usize {
        if self.entries.is_empty() {
            return 0;
        }
        let mut restored = 0usize;
        for episode in episodes.iter_mut() {
            let Some(saved) = self.entries.get(&AnnotationKey::of(episode)) else {
                continue;
            };
            episode.reason_id = saved.reason_id;
            episode.reason_name = saved.reason_name.clone();
            episode.note = saved.note.clone();
            restored += 1;
        }
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn episode(code: &str, start_minute: i64, end_minute: i64) -> AlarmEpisode {
        let base = Utc.with_ymd_and_hms(2026, 1, 9, 7, 0, 0).unwrap();
        AlarmEpisode {
            job_id: 1,
            machine_id: 4,
            machine_name: "Labeler".to_string(),
            tag_id: 40,
            tag_name: "Alarm".to_string(),
            line_id: 2,
            line_name: "Line 2".to_string(),
            alarm_code: code.to_string(),
            start_time: base + Duration::minutes(start_minute),
            end_time: base + Duration::minutes(end_minute),
            duration_minutes: (end_minute - start_minute) as f64,
            reason_id: None,
            reason_name: None,
            note: None,
            processed: false,
        }
    }

    #[test]
    fn restores_only_episodes_with_identical_boundaries() {
        let mut annotated = episode("12", 0, 5);
        annotated.reason_id = Some(9);
        annotated.reason_name = Some("Jam".to_string());
        let mut noted = episode("7", 10, 20);
        noted.note = Some("operator cleared".to_string());
        let snapshot =
            AnnotationSnapshot::from_episodes(vec![annotated, noted, episode("3", 30, 31)]);
        assert_eq!(snapshot.len(), 2);

        let mut fresh = vec![episode("12", 0, 5), episode("7", 10, 21), episode("3", 30, 31)];
        assert_eq!(snapshot.restore(&mut fresh), 1);
        assert_eq!(fresh[0].reason_id, Some(9));
        assert_eq!(fresh[0].reason_name.as_deref(), Some("Jam"));
        assert!(fresh[1].note.is_none());
        assert!(!fresh[2].has_annotation());
    }

    #[test]
    fn key_fields_do_not_collide_through_concatenation() {
        let mut left = episode("1", 0, 5);
        left.tag_id = 12;
        left.alarm_code = "3".to_string();
        let mut right = episode("31", 0, 5);
        right.tag_id = 1;
        right.alarm_code = "23".to_string();
        assert_ne!(AnnotationKey::of(&left), AnnotationKey::of(&right));
    }
}
