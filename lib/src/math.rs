//! Math utilities.
use std::cmp::Ordering;

/// Cubic hermite spline, as implemented by Unity's `AnimationCurve`.
///
/// Keyframes are kept sorted by time. Keys added without explicit
/// tangents get automatic tangents that are recomputed whenever a
/// neighbour changes. Outside the key range the curve is clamped to the
/// first or last value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct H1 {
    frames: Vec<HFrame>,
}

impl H1 {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    fn interpolant(x1: f64, y1: f64, yp1: f64, x2: f64, y2: f64, yp2: f64, x: f64) -> f64 {
        let t = (x - x1) / (x2 - x1);
        let t2 = t * t;
        let t3 = t2 * t;
        let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
        let h10 = t3 - 2.0 * t2 + t;
        let h01 = -2.0 * t3 + 3.0 * t2;
        let h11 = t3 - t2;
        h00 * y1 + h10 * (x2 - x1) * yp1 + h01 * y2 + h11 * (x2 - x1) * yp2
    }

    pub fn add(&mut self, time: f64, value: f64) {
        self.insert(HFrame {
            in_tangent: 0.0,
            out_tangent: 0.0,
            time,
            value,
            auto_tangent: true,
        });
    }

    pub fn add_with_tangents(&mut self, time: f64, value: f64, in_tangent: f64, out_tangent: f64) {
        self.insert(HFrame {
            in_tangent,
            out_tangent,
            time,
            value,
            auto_tangent: false,
        });
    }

    /// Inserts after any existing keys with the same time.
    fn insert(&mut self, frame: HFrame) {
        let i = self
            .frames
            .partition_point(|x| x.time.total_cmp(&frame.time) != Ordering::Greater);
        self.frames.insert(i, frame);
        self.recompute_tangents(i);
    }

    fn recompute_tangents(&mut self, i: usize) {
        if self.frames.len() == 1 {
            let frame = &mut self.frames[0];
            if frame.auto_tangent {
                frame.in_tangent = 0.0;
                frame.out_tangent = 0.0;
            }
            return;
        }

        self.fix_tangent(i);

        if i != 0 {
            self.fix_tangent(i - 1);
        }
        if i != self.frames.len() - 1 {
            self.fix_tangent(i + 1);
        }
    }

    fn fix_tangent(&mut self, i: usize) {
        let last = self.frames.len() - 1;
        let current = self.frames[i];
        if !current.auto_tangent {
            return;
        }

        let slope = |a: HFrame, b: HFrame| {
            let dt = b.time - a.time;
            if dt == 0.0 {
                0.0
            } else {
                (b.value - a.value) / dt
            }
        };

        let tangent = if i == 0 {
            slope(current, self.frames[i + 1])
        } else if i == last {
            slope(self.frames[i - 1], current)
        } else {
            (slope(current, self.frames[i + 1]) + slope(self.frames[i - 1], current)) / 2.0
        };

        self.frames[i].in_tangent = tangent;
        self.frames[i].out_tangent = tangent;
    }

    /// Evaluates the curve at `t`. An empty curve evaluates to zero.
    pub fn evaluate(&self, t: f64) -> f64 {
        let (Some(first), Some(last)) = (self.frames.first(), self.frames.last()) else {
            return 0.0;
        };

        if t <= first.time {
            return first.value;
        }

        if t >= last.time {
            return last.value;
        }

        let hi = self.frames.partition_point(|x| x.time < t);
        let right = self.frames[hi];
        if right.time == t {
            return right.value;
        }
        let left = self.frames[hi - 1];

        Self::interpolant(
            left.time,
            left.value,
            left.out_tangent,
            right.time,
            right.value,
            right.in_tangent,
            t,
        )
    }
}

impl FromIterator<(f64, f64)> for H1 {
    fn from_iter<I: IntoIterator<Item = (f64, f64)>>(iter: I) -> Self {
        let mut curve = Self::new();
        for (time, value) in iter {
            curve.add(time, value);
        }
        curve
    }
}

impl FromIterator<(f64, f64, f64, f64)> for H1 {
    fn from_iter<I: IntoIterator<Item = (f64, f64, f64, f64)>>(iter: I) -> Self {
        let mut curve = Self::new();
        for (time, value, in_tangent, out_tangent) in iter {
            curve.add_with_tangents(time, value, in_tangent, out_tangent);
        }
        curve
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
struct HFrame {
    in_tangent: f64,
    out_tangent: f64,
    time: f64,
    value: f64,
    auto_tangent: bool,
}
