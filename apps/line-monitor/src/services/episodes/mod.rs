use chrono::{DateTime, Utc};

use crate::time::{minutes_between, whole_minutes_between};

mod labels;
pub mod types;

pub use labels::{known_state_label, state_label};
pub use types::{
    AlarmEpisode, EpisodeContext, EpisodeKind, MachineStateEpisode, TagSample,
};

pub const ALARM_BASELINE: &str = "0";

/// Preform feeders report spurious long alarms; anything above this is noise.
const PREFORM_FEEDER_MAX_ALARM_MINUTES: f64 = 30.0;
const PREFORM_FEEDER_NAMES: [&str; 2] = ["preformfeeder", "preform-feeder"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentPolicy {
    /// `"0"` is the baseline: it never opens an episode.
    Alarm,
    /// Every value, including 0, is a state worth timing.
    State,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub value: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlarmSegmentation {
    pub episodes: Vec<AlarmEpisode>,
    pub suppressed: usize,
}

/// Cuts an ordered sample stream into contiguous runs of one value.
///
/// A run ends at the timestamp of the first sample carrying a different
/// value, and the next run starts at that same instant. The last open run is
/// closed at the final sample's timestamp. Fewer than two samples cannot
/// establish a duration, and zero-length runs are dropped.
pub fn segment(samples: &[TagSample], policy: SegmentPolicy) -> Vec<Span> {
    if samples.len() < 2 {
        return Vec::new();
    }

    let opens_episode =
        |value: &str| policy == SegmentPolicy::State || value != ALARM_BASELINE;

    let mut spans: Vec<Span> = Vec::new();
    let mut active: Option<(&str, DateTime<Utc>)> = None;

    for pair in samples.windows(2) {
        let (current, next) = (&pair[0], &pair[1]);

        let (active_value, active_start) = match active {
            Some(open) => open,
            None => {
                if !opens_episode(&current.value) {
                    continue;
                }
                (current.value.as_str(), current.timestamp)
            }
        };

        if next.value == active_value {
            active = Some((active_value, active_start));
            continue;
        }

        push_span(&mut spans, active_value, active_start, next.timestamp);
        active = if opens_episode(&next.value) {
            Some((next.value.as_str(), next.timestamp))
        } else {
            None
        };
    }

    if let (Some((value, start)), Some(last)) = (active, samples.last()) {
        if last.value == value {
            push_span(&mut spans, value, start, last.timestamp);
        }
    }

    spans
}

fn push_span(spans: &mut Vec<Span>, value: &str, start: DateTime<Utc>, end: DateTime<Utc>) {
    if end <= start {
        return;
    }
    spans.push(Span {
        value: value.to_string(),
        start,
        end,
    });
}

pub fn is_preform_feeder(machine_name: &str) -> bool {
    let lowered = machine_name.to_lowercase();
    PREFORM_FEEDER_NAMES
        .iter()
        .any(|name| lowered.contains(name))
}

pub fn alarm_episodes(ctx: &EpisodeContext, samples: &[TagSample]) -> AlarmSegmentation {
    let preform_feeder = is_preform_feeder(&ctx.machine_name);
    let mut out = AlarmSegmentation::default();

    for span in segment(samples, SegmentPolicy::Alarm) {
        let duration_minutes = minutes_between(span.start, span.end);
        if preform_feeder && duration_minutes > PREFORM_FEEDER_MAX_ALARM_MINUTES {
            tracing::info!(
                job_id = ctx.job_id,
                machine = %ctx.machine_name,
                tag_id = ctx.tag_id,
                alarm_code = %span.value,
                duration_minutes,
                "suppressing long preform feeder alarm"
            );
            out.suppressed += 1;
            continue;
        }

        out.episodes.push(AlarmEpisode {
            job_id: ctx.job_id,
            machine_id: ctx.machine_id,
            machine_name: ctx.machine_name.clone(),
            tag_id: ctx.tag_id,
            tag_name: ctx.tag_name.clone(),
            line_id: ctx.line_id,
            line_name: ctx.line_name.clone(),
            alarm_code: span.value,
            start_time: span.start,
            end_time: span.end,
            duration_minutes,
            reason_id: None,
            reason_name: None,
            note: None,
            processed: false,
        });
    }

    out
}

pub fn state_episodes(ctx: &EpisodeContext, samples: &[TagSample]) -> Vec<MachineStateEpisode> {
    segment(samples, SegmentPolicy::State)
        .into_iter()
        .map(|span| {
            let (state_code, state_name) = match span.value.trim().parse::<i32>() {
                Ok(code) => (code, state_label(code)),
                Err(_) => {
                    tracing::warn!(
                        job_id = ctx.job_id,
                        tag_id = ctx.tag_id,
                        value = %span.value,
                        "non-integer machine state value"
                    );
                    (-1, format!("Unknown State ({})", span.value.trim()))
                }
            };
            MachineStateEpisode {
                job_id: ctx.job_id,
                machine_id: ctx.machine_id,
                machine_name: ctx.machine_name.clone(),
                tag_id: ctx.tag_id,
                tag_name: ctx.tag_name.clone(),
                line_id: ctx.line_id,
                line_name: ctx.line_name.clone(),
                state_code,
                state_name,
                start_time: span.start,
                end_time: span.end,
                duration_minutes: whole_minutes_between(span.start, span.end),
                user_note: None,
                processed: false,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 6, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn samples(points: &[(&str, i64)]) -> Vec<TagSample> {
        points
            .iter()
            .map(|(value, minute)| TagSample::new(7, *value, t(*minute)))
            .collect()
    }

    fn ctx(machine_name: &str) -> EpisodeContext {
        EpisodeContext {
            job_id: 11,
            machine_id: 3,
            machine_name: machine_name.to_string(),
            tag_id: 7,
            tag_name: "Alarm Word".to_string(),
            line_id: 1,
            line_name: "Line 1".to_string(),
        }
    }

    fn span(value: &str, start: i64, end: i64) -> Span {
        Span {
            value: value.to_string(),
            start: t(start),
            end: t(end),
        }
    }

    #[test]
    fn fewer_than_two_samples_yield_nothing() {
        assert!(segment(&[], SegmentPolicy::Alarm).is_empty());
        assert!(segment(&samples(&[("5", 0)]), SegmentPolicy::Alarm).is_empty());
        assert!(segment(&samples(&[("1", 0)]), SegmentPolicy::State).is_empty());
    }

    #[test]
    fn alarm_baseline_is_skipped_and_end_is_first_different_sample() {
        let spans = segment(&samples(&[("0", 0), ("5", 1), ("0", 2)]), SegmentPolicy::Alarm);
        assert_eq!(spans, vec![span("5", 1, 2)]);

        let spans = segment(&samples(&[("0", 0), ("0", 1)]), SegmentPolicy::Alarm);
        assert!(spans.is_empty());
    }

    #[test]
    fn alarm_runs_chain_without_gaps() {
        let spans = segment(
            &samples(&[("5", 0), ("5", 2), ("9", 4), ("9", 5), ("0", 8), ("3", 9), ("3", 12)]),
            SegmentPolicy::Alarm,
        );
        assert_eq!(spans, vec![span("5", 0, 4), span("9", 4, 8), span("3", 9, 12)]);
    }

    #[test]
    fn state_runs_include_zero_and_close_on_last_sample() {
        let spans = segment(&samples(&[("1", 0), ("2", 1), ("2", 2)]), SegmentPolicy::State);
        assert_eq!(spans, vec![span("1", 0, 1), span("2", 1, 2)]);

        let spans = segment(&samples(&[("0", 0), ("1", 3), ("0", 5)]), SegmentPolicy::State);
        assert_eq!(spans, vec![span("0", 0, 3), span("1", 3, 5)]);
    }

    #[test]
    fn trailing_single_sample_run_has_no_duration() {
        let spans = segment(&samples(&[("4", 0), ("6", 10)]), SegmentPolicy::Alarm);
        assert_eq!(spans, vec![span("4", 0, 10)]);
    }

    #[test]
    fn preform_feeder_long_alarms_are_suppressed() {
        let long = samples(&[("0", 0), ("12", 5), ("0", 50)]);
        let short = samples(&[("0", 0), ("12", 5), ("0", 15)]);

        let dropped = alarm_episodes(&ctx("Preform-Feeder-3"), &long);
        assert!(dropped.episodes.is_empty());
        assert_eq!(dropped.suppressed, 1);

        let kept = alarm_episodes(&ctx("Preform-Feeder-3"), &short);
        assert_eq!(kept.episodes.len(), 1);
        assert!((kept.episodes[0].duration_minutes - 10.0).abs() < f64::EPSILON);

        let other_machine = alarm_episodes(&ctx("Blow Molder"), &long);
        assert_eq!(other_machine.episodes.len(), 1);
        assert!(is_preform_feeder("LINE2 PREFORMFEEDER"));
    }

    #[test]
    fn state_episodes_carry_labels_and_whole_minutes() {
        let mut points = samples(&[("1", 0), ("16", 3), ("abc", 7), ("abc", 8)]);
        points[1].timestamp += Duration::seconds(50);
        let episodes = state_episodes(&ctx("Filler"), &points);

        assert_eq!(episodes.len(), 3);
        assert_eq!(episodes[0].state_name, "Running");
        assert_eq!(episodes[0].duration_minutes, 3);
        assert_eq!(episodes[1].state_code, 16);
        assert_eq!(episodes[1].state_name, "Faulted");
        assert_eq!(episodes[1].duration_minutes, 3);
        assert_eq!(episodes[2].state_code, -1);
        assert_eq!(episodes[2].state_name, "Unknown State (abc)");
    }
}
