use std::time::Duration;

/// One ramp segment: move linearly to `target` over `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub target: u64,
    pub duration: Duration,
}

impl Stage {
    pub fn new(target: u64, duration: Duration) -> Self {
        Self { target, duration }
    }
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    begin: f64,
    length: f64,
    from: f64,
    to: f64,
}

/// Piecewise-linear target curve over elapsed scenario time.
///
/// The curve starts at `start` and ramps through each stage in order. At a
/// stage boundary the value is exactly the finished stage's target; after the
/// last stage it holds the last target.
#[derive(Debug, Clone)]
pub struct StageCurve {
    start: f64,
    segments: Vec<Segment>,
    total: Duration,
}

impl StageCurve {
    pub fn new(start: u64, stages: &[Stage]) -> Self {
        let mut segments = Vec::with_capacity(stages.len());
        let mut begin = 0.0;
        let mut prev = start as f64;
        let mut total = Duration::ZERO;
        for stage in stages {
            let length = stage.duration.as_secs_f64();
            segments.push(Segment {
                begin,
                length,
                from: prev,
                to: stage.target as f64,
            });
            begin += length;
            prev = stage.target as f64;
            total = total.saturating_add(stage.duration);
        }
        Self {
            start: start as f64,
            segments,
            total,
        }
    }

    /// A flat curve holding `value` for `duration`.
    pub fn constant(value: u64, duration: Duration) -> Self {
        Self::new(value, &[Stage::new(value, duration)])
    }

    pub fn total_duration(&self) -> Duration {
        self.total
    }

    pub fn start_value(&self) -> f64 {
        self.start
    }

    pub fn end_value(&self) -> f64 {
        self.segments.last().map(|s| s.to).unwrap_or(self.start)
    }

    /// Highest value the curve ever reaches.
    pub fn peak(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| s.to)
            .fold(self.start, f64::max) as u64
    }

    pub fn value_at(&self, elapsed: Duration) -> f64 {
        let t = elapsed.as_secs_f64();
        for seg in &self.segments {
            if seg.length > 0.0 && t < seg.begin + seg.length {
                let progress = ((t - seg.begin) / seg.length).max(0.0);
                return seg.from + (seg.to - seg.from) * progress;
            }
        }
        self.end_value()
    }
}

/// Deterministic, evenly spaced arrival instants for a rate curve.
///
/// The rate curve is expressed in iterations per `time_unit`. Arrival `k`
/// happens where the integral of the rate first reaches `k` (or `k + 1` when
/// the curve starts at zero, so a ramp from nothing does not fire at t=0).
/// Arrivals at or after `run_length` do not happen.
#[derive(Debug, Clone)]
pub struct ArrivalSchedule {
    segments: Vec<Segment>,
    // Arrivals accumulated before each segment.
    cumulative: Vec<f64>,
    total_arrivals: f64,
    run_length: Duration,
    unit_secs: f64,
    base: f64,
}

impl ArrivalSchedule {
    pub fn new(curve: &StageCurve, time_unit: Duration, run_length: Duration) -> Self {
        let unit_secs = time_unit.as_secs_f64().max(f64::MIN_POSITIVE);
        let limit = run_length.as_secs_f64();

        let mut segments: Vec<Segment> = Vec::new();
        for seg in &curve.segments {
            if seg.length <= 0.0 || seg.begin >= limit {
                continue;
            }
            let length = seg.length.min(limit - seg.begin);
            let to = seg.from + (seg.to - seg.from) * (length / seg.length);
            segments.push(Segment { length, to, ..*seg });
        }
        let covered = curve.total_duration().as_secs_f64();
        if limit > covered {
            let hold = curve.end_value();
            segments.push(Segment {
                begin: covered,
                length: limit - covered,
                from: hold,
                to: hold,
            });
        }

        let mut cumulative = Vec::with_capacity(segments.len());
        let mut acc = 0.0;
        for seg in &segments {
            cumulative.push(acc);
            acc += (seg.from + seg.to) / 2.0 * seg.length / unit_secs;
        }

        let base = if curve.start_value() > 0.0 { 0.0 } else { 1.0 };
        Self {
            segments,
            cumulative,
            total_arrivals: acc,
            run_length,
            unit_secs,
            base,
        }
    }

    /// Number of arrivals the schedule will produce.
    pub fn expected_arrivals(&self) -> u64 {
        let n = self.total_arrivals - self.base;
        if n <= 0.0 {
            return 0;
        }
        // Arrivals landing exactly on run_length are excluded.
        let whole = n.floor();
        if (n - whole).abs() < 1e-9 {
            whole as u64
        } else {
            whole as u64 + 1
        }
    }

    /// Offset of arrival `k` from the scenario start, or `None` when it falls
    /// outside the run.
    pub fn arrival_at(&self, k: u64) -> Option<Duration> {
        let target = k as f64 + self.base;
        if target > self.total_arrivals + 1e-9 {
            return None;
        }
        for (i, seg) in self.segments.iter().enumerate() {
            let before = self.cumulative[i];
            let after = self
                .cumulative
                .get(i + 1)
                .copied()
                .unwrap_or(self.total_arrivals);
            if target > after + 1e-9 {
                continue;
            }
            if after - before <= 0.0 && target > before + 1e-9 {
                continue;
            }
            // Solve before + r0*tau + (r1 - r0) * tau^2 / (2L) = target, rates per second.
            let r0 = seg.from / self.unit_secs;
            let r1 = seg.to / self.unit_secs;
            let a = (r1 - r0) / (2.0 * seg.length);
            let b = r0;
            let c = before - target;
            let disc = (b * b - 4.0 * a * c).max(0.0);
            let denom = b + disc.sqrt();
            let tau = if denom > 0.0 { -2.0 * c / denom } else { 0.0 };
            let at = seg.begin + tau.clamp(0.0, seg.length);
            return Duration::try_from_secs_f64(at.max(0.0))
                .ok()
                .filter(|at| *at < self.run_length);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_linear_interpolation() {
        let curve = StageCurve::new(0, &[Stage::new(10, secs(10))]);
        assert_eq!(curve.value_at(secs(0)), 0.0);
        assert!((curve.value_at(secs(5)) - 5.0).abs() < 1e-9);
        assert!((curve.value_at(Duration::from_millis(2500)) - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_stage_boundary_holds_finished_target() {
        let curve = StageCurve::new(0, &[Stage::new(10, secs(60)), Stage::new(50, secs(30))]);
        // Just before the boundary we are almost at 10.
        let before = curve.value_at(secs(60) - Duration::from_millis(1));
        assert!(before < 10.0 && before > 9.99);
        // At the boundary we are exactly at the first target, not the second.
        assert_eq!(curve.value_at(secs(60)), 10.0);
        // Just after, still near 10.
        let after = curve.value_at(secs(60) + Duration::from_millis(1));
        assert!(after > 10.0 && after < 10.01);
        // The second target is only reached at the end of its own stage.
        assert!(curve.value_at(secs(89)) < 50.0);
        assert_eq!(curve.value_at(secs(90)), 50.0);
    }

    #[test]
    fn test_zero_duration_stage_jumps() {
        let curve = StageCurve::new(5, &[Stage::new(0, secs(0)), Stage::new(10, secs(60))]);
        assert_eq!(curve.value_at(secs(0)), 0.0);
        assert!((curve.value_at(secs(30)) - 5.0).abs() < 1e-9);
        assert_eq!(curve.total_duration(), secs(60));
    }

    #[test]
    fn test_start_value_is_first_ramp_origin() {
        let curve = StageCurve::new(50, &[Stage::new(500, secs(30))]);
        assert_eq!(curve.value_at(secs(0)), 50.0);
        assert!((curve.value_at(secs(15)) - 275.0).abs() < 1e-9);
        assert_eq!(curve.peak(), 500);
    }

    #[test]
    fn test_value_after_last_stage_holds() {
        let curve = StageCurve::new(0, &[Stage::new(10, secs(10)), Stage::new(3, secs(10))]);
        assert_eq!(curve.value_at(secs(100)), 3.0);
        assert_eq!(StageCurve::new(7, &[]).value_at(secs(1)), 7.0);
    }

    #[test]
    fn test_constant_arrivals_evenly_spaced() {
        let curve = StageCurve::constant(10, secs(10));
        let schedule = ArrivalSchedule::new(&curve, secs(1), secs(10));
        assert_eq!(schedule.expected_arrivals(), 100);
        assert_eq!(schedule.arrival_at(0), Some(Duration::ZERO));
        let a1 = schedule.arrival_at(1).unwrap();
        let a2 = schedule.arrival_at(2).unwrap();
        assert!((a1.as_secs_f64() - 0.1).abs() < 1e-6);
        assert!((a2.as_secs_f64() - 0.2).abs() < 1e-6);
        assert!(schedule.arrival_at(99).is_some());
        assert!(schedule.arrival_at(100).is_none());
    }

    #[test]
    fn test_time_unit_scales_rate() {
        // 100 iterations per 10s for 1 minute.
        let curve = StageCurve::constant(100, secs(60));
        let schedule = ArrivalSchedule::new(&curve, secs(10), secs(60));
        assert_eq!(schedule.expected_arrivals(), 600);
        let a1 = schedule.arrival_at(1).unwrap();
        assert!((a1.as_secs_f64() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_ramping_arrivals_accelerate() {
        let curve = StageCurve::new(0, &[Stage::new(20, secs(10))]);
        let schedule = ArrivalSchedule::new(&curve, secs(1), secs(10));
        // Integral of a 0 -> 20 ramp over 10s is 100; the 100th lands on the end.
        assert_eq!(schedule.expected_arrivals(), 99);
        assert!(schedule.arrival_at(99).is_none());
        let mut prev = Duration::ZERO;
        let mut prev_gap = Duration::MAX;
        for k in 0..99 {
            let at = schedule.arrival_at(k).unwrap();
            assert!(at > prev || k == 0);
            if k > 1 {
                let gap = at - prev;
                assert!(gap <= prev_gap.saturating_add(Duration::from_micros(1)));
                prev_gap = gap;
            }
            prev = at;
        }
        // First arrival of a ramp from zero is not at t=0.
        assert!(schedule.arrival_at(0).unwrap() > Duration::ZERO);
    }

    #[test]
    fn test_decreasing_ramp_arrivals_within_segment() {
        let curve = StageCurve::new(20, &[Stage::new(0, secs(10))]);
        let schedule = ArrivalSchedule::new(&curve, secs(1), secs(10));
        assert_eq!(schedule.expected_arrivals(), 100);
        for k in 0..100 {
            let at = schedule.arrival_at(k).unwrap();
            assert!(at < secs(10));
        }
    }

    #[test]
    fn test_run_length_override_extends_last_target() {
        let curve = StageCurve::new(10, &[Stage::new(10, secs(5))]);
        let schedule = ArrivalSchedule::new(&curve, secs(1), secs(10));
        assert_eq!(schedule.expected_arrivals(), 100);

        let truncated = ArrivalSchedule::new(&curve, secs(1), secs(2));
        assert_eq!(truncated.expected_arrivals(), 20);
        assert!(truncated.arrival_at(20).is_none());
    }

    #[test]
    fn test_zero_rate_produces_nothing() {
        let curve = StageCurve::constant(0, secs(30));
        let schedule = ArrivalSchedule::new(&curve, secs(1), secs(30));
        assert_eq!(schedule.expected_arrivals(), 0);
        assert!(schedule.arrival_at(0).is_none());
    }
}
