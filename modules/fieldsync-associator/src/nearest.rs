use chrono::{DateTime, Duration, Utc};

use crate::types::Candidate;

/// The candidate closest in time to `probe_time`, with the distance in whole
/// milliseconds. Equidistant candidates are broken by `(time, id)` ascending,
/// so the earlier reading wins.
pub fn nearest(probe_time: DateTime<Utc>, candidates: &[Candidate]) -> Option<(&Candidate, i64)> {
    let distance = |c: &Candidate| -> Duration { (c.time - probe_time).abs() };

    candidates
        .iter()
        .min_by(|a, b| {
            distance(a)
                .cmp(&distance(b))
                .then_with(|| a.time.cmp(&b.time))
                .then_with(|| a.id.cmp(&b.id))
        })
        .map(|c| (c, distance(c).num_milliseconds()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn reading(id: i64, ms: i64) -> Candidate {
        Candidate {
            id,
            time: at(ms),
            tenant_id: "farm-a".into(),
            sensor_id: None,
            metric: "weight".into(),
            value_num: Some(id as f64),
        }
    }

    #[test]
    fn picks_smallest_distance() {
        let candidates = vec![reading(1, 700), reading(2, 1_400)];
        let (best, delta) = nearest(at(1_000), &candidates).unwrap();
        assert_eq!(best.id, 1);
        assert_eq!(delta, 300);
    }

    #[test]
    fn equidistant_prefers_earlier_time() {
        let candidates = vec![reading(9, 1_250), reading(3, 750)];
        let (best, delta) = nearest(at(1_000), &candidates).unwrap();
        assert_eq!(best.id, 3);
        assert_eq!(delta, 250);
    }

    #[test]
    fn same_time_prefers_lower_id() {
        let candidates = vec![reading(5, 900), reading(4, 900)];
        assert_eq!(nearest(at(1_000), &candidates).unwrap().0.id, 4);
    }

    #[test]
    fn order_of_input_does_not_matter() {
        let mut candidates = vec![reading(1, 800), reading(2, 1_200), reading(3, 1_100)];
        let first = nearest(at(1_000), &candidates).unwrap().0.id;
        candidates.reverse();
        assert_eq!(nearest(at(1_000), &candidates).unwrap().0.id, first);
        assert_eq!(first, 3);
    }

    #[test]
    fn empty_has_no_match() {
        assert!(nearest(at(0), &[]).is_none());
    }
}
