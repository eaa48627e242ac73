//! Guide star location
//!
//! [`StarTracker::locate`] re-finds the guide star near its last known
//! position on every frame and classifies the measurement. The only state
//! it keeps between frames is the last measured mass and a counter of
//! consecutive mass-change rejections.

use crate::config::TrackerConfig;
use crate::error::{GuideError, GuideResult};
use nightshade_gear::{Frame, NoiseReduction, Point, Rect};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Side of the square box used for the centroid (must be odd)
const CENTROID_BOX: i64 = 15;
const CENTROID_HALF: i64 = CENTROID_BOX / 2;

/// A mass change above this fraction disables the check entirely
const MASS_CHANGE_DISABLED: f64 = 0.99;

/// Consecutive mass-change rejections before a frame is accepted anyway
const MAX_MASS_REJECTIONS: u32 = 2;

/// Outcome classification of one star measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FindResult {
    Ok,
    /// Found, but the peak is clipped; advisory only
    Saturated,
    LowSnr,
    LowMass,
    /// The star is too close to the frame edge or jumped out of the search region
    LargeMotion,
    MassChange,
}

impl FindResult {
    /// Whether the position in the fix can be used for guiding
    pub fn is_found(self) -> bool {
        matches!(self, FindResult::Ok | FindResult::Saturated)
    }
}

impl fmt::Display for FindResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FindResult::Ok => "ok",
            FindResult::Saturated => "star saturated",
            FindResult::LowSnr => "low SNR",
            FindResult::LowMass => "low star mass",
            FindResult::LargeMotion => "star moved too far or is too near the edge",
            FindResult::MassChange => "star mass changed",
        };
        f.write_str(text)
    }
}

/// One measurement of the guide star
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StarFix {
    /// Centroid, or the prior position when the star was not found
    pub position: Point,
    pub mass: f64,
    pub snr: f64,
    pub result: FindResult,
}

impl StarFix {
    fn rejected(prior: Point, result: FindResult) -> Self {
        Self {
            position: prior,
            mass: 0.0,
            snr: 0.0,
            result,
        }
    }

    pub fn found(&self) -> bool {
        self.result.is_found()
    }
}

#[derive(Debug, Clone)]
pub struct StarTracker {
    config: TrackerConfig,
    guiding: bool,
    last_mass: f64,
    mass_rejections: u32,
}

impl StarTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            guiding: false,
            last_mass: 0.0,
            mass_rejections: 0,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Mass-change rejection only applies while guiding. Starting to guide
    /// forgets the rejection history.
    pub fn set_guiding(&mut self, guiding: bool) {
        if guiding && !self.guiding {
            self.reset();
        }
        self.guiding = guiding;
    }

    pub fn reset(&mut self) {
        self.last_mass = 0.0;
        self.mass_rejections = 0;
    }

    /// Find the star within `search_radius` of `prior`.
    pub fn locate(&mut self, frame: &Frame, prior: Point, search_radius: u32) -> StarFix {
        let Some(m) = measure(frame, prior, search_radius) else {
            tracing::debug!(
                "Star at ({:.1}, {:.1}) too near the frame edge",
                prior.x,
                prior.y
            );
            return StarFix::rejected(prior, FindResult::LargeMotion);
        };

        let threshold = self.config.mass_change_threshold;
        if self.guiding
            && self.config.mass_change_enabled
            && threshold < MASS_CHANGE_DISABLED
            && self.last_mass > 0.0
            && m.mass > 0.0
        {
            let change = 1.0 - (m.mass / self.last_mass).min(self.last_mass / m.mass);
            if change > threshold && self.mass_rejections < MAX_MASS_REJECTIONS {
                tracing::info!(
                    "Star mass changed by {:.0}% (mass {:.0} -> {:.0}), frame rejected",
                    change * 100.0,
                    self.last_mass,
                    m.mass
                );
                self.mass_rejections += 1;
                self.last_mass = m.mass;
                return StarFix {
                    position: prior,
                    mass: m.mass,
                    snr: m.snr,
                    result: FindResult::MassChange,
                };
            }
        }
        self.last_mass = m.mass;

        let result = if m.mass < self.config.min_mass {
            FindResult::LowMass
        } else if m.snr < self.config.min_snr {
            FindResult::LowSnr
        } else if m.saturated {
            FindResult::Saturated
        } else {
            FindResult::Ok
        };

        if !result.is_found() {
            return StarFix {
                position: prior,
                mass: m.mass,
                snr: m.snr,
                result,
            };
        }

        self.mass_rejections = 0;
        StarFix {
            position: m.centroid,
            mass: m.mass,
            snr: m.snr,
            result,
        }
    }

    /// Pick the most star-like spot in the frame (or `roi`) and measure it.
    pub fn auto_select(&mut self, frame: &Frame, roi: Option<Rect>) -> GuideResult<StarFix> {
        if frame.subframe.is_some() {
            tracing::debug!("Auto-select called on a subframe");
            return Err(GuideError::NoGuideStar);
        }

        let mut smoothed = frame.clone();
        smoothed.apply_noise_reduction(NoiseReduction::Median3x3);

        let margin = self.config.auto_select_margin.max(PSF_REACH as u32 + 1);
        let candidate =
            best_psf_match(&smoothed, roi, margin).ok_or(GuideError::NoGuideStar)?;
        tracing::debug!("Auto-select candidate at ({}, {})", candidate.x, candidate.y);

        let fix = self.locate(frame, candidate, self.config.search_region);
        if !fix.found() {
            tracing::info!("Auto-select candidate rejected: {}", fix.result);
            return Err(GuideError::NoGuideStar);
        }
        Ok(fix)
    }
}

// =============================================================================
// CENTROID
// =============================================================================

struct Measurement {
    centroid: Point,
    mass: f64,
    snr: f64,
    saturated: bool,
}

/// Background statistics, peak search and thresholded centroid.
///
/// Returns `None` when the search window or the centroid box would leave the
/// valid region of the frame.
fn measure(frame: &Frame, prior: Point, search_radius: u32) -> Option<Measurement> {
    if !prior.x.is_finite() || !prior.y.is_finite() {
        return None;
    }
    let region = frame.valid_region();
    let (left, top) = (region.x as i64, region.y as i64);
    let (right, bottom) = (region.right() as i64, region.bottom() as i64);

    let radius = search_radius as i64;
    let size = radius * 2 + 1;
    let start_x = prior.x as i64 - radius;
    let start_y = prior.y as i64 - radius;

    // The smoothing kernel reads one pixel beyond the window on each side
    if start_x < left + 1
        || start_x + size + 1 >= right
        || start_y < top + 1
        || start_y + size + 1 >= bottom
    {
        return None;
    }

    let px = |x: i64, y: i64| frame.pixel(x as u32, y as u32);

    let mut local_min = u16::MAX;
    let mut local_sum = 0.0;
    for y in start_y..start_y + size {
        for x in start_x..start_x + size {
            let v = px(x, y);
            local_min = local_min.min(v);
            local_sum += v as f64;
        }
    }
    let count = (size * size) as f64;
    let local_mean = local_sum / count;

    // Peak of the plus-shaped smoothed image, centre weighted twice
    let mut peak_val = 0u32;
    let (mut peak_x, mut peak_y) = (start_x, start_y);
    let (mut max, mut near_max1, mut near_max2) = (0u16, 0u16, 0u16);
    let mut sval_sum = 0.0;
    for y in start_y..start_y + size {
        for x in start_x..start_x + size {
            let centre = px(x, y) as u32;
            let smoothed = 2 * centre
                + px(x + 1, y) as u32
                + px(x - 1, y) as u32
                + px(x, y + 1) as u32
                + px(x, y - 1) as u32;
            if smoothed >= peak_val {
                peak_val = smoothed;
                peak_x = x;
                peak_y = y;
            }

            let sval = px(x, y) - local_min;
            if sval >= max {
                near_max2 = near_max1;
                near_max1 = max;
                max = sval;
            }
            sval_sum += sval as f64;
        }
    }
    let mean = sval_sum / count;

    if peak_x - CENTROID_HALF < left
        || peak_x + CENTROID_HALF >= right
        || peak_y - CENTROID_HALF < top
        || peak_y + CENTROID_HALF >= bottom
    {
        return None;
    }

    // Progressively lower thresholds until there is enough mass
    let thresholds = [
        local_mean + (max as f64 + local_min as f64 - local_mean) / 10.0,
        local_mean,
        local_min as f64,
    ];
    let (mut mass, mut mx, mut my) = (0.0, 0.0, 0.0);
    for threshold in thresholds {
        mass = 1e-6;
        mx = 1e-6;
        my = 1e-6;
        for y in peak_y - CENTROID_HALF..=peak_y + CENTROID_HALF {
            for x in peak_x - CENTROID_HALF..=peak_x + CENTROID_HALF {
                let val = px(x, y) as f64 - threshold;
                if val > 0.0 {
                    mx += x as f64 * val;
                    my += y as f64 * val;
                    mass += val;
                }
            }
        }
        if mass >= 10.0 {
            break;
        }
    }

    let snr = if mean > 0.0 { max as f64 / mean } else { 0.0 };
    Some(Measurement {
        centroid: Point::new(mx / mass, my / mass),
        mass,
        snr,
        saturated: max == near_max2,
    })
}

// =============================================================================
// AUTO-SELECT
// =============================================================================

const PSF_REACH: i64 = 4;

/// Radial weights of an idealised star profile, indexed by ring class
const PSF_WEIGHTS: [f64; 9] = [0.906, 0.584, 0.365, 0.117, 0.049, -0.05, -0.064, -0.074, -0.094];

/// Ring class of an offset inside the 9x9 kernel
fn ring_class(dx: i64, dy: i64) -> usize {
    let (a, b) = (dx.abs().max(dy.abs()), dx.abs().min(dy.abs()));
    match (a, b) {
        (0, 0) => 0,
        (1, 0) => 1,
        (1, 1) => 2,
        (2, 0) => 3,
        (2, 1) => 4,
        (2, 2) => 5,
        (3, 0) => 6,
        (3, 1) => 7,
        _ => 8,
    }
}

/// Location whose neighbourhood best matches a star profile
fn best_psf_match(frame: &Frame, roi: Option<Rect>, margin: u32) -> Option<Point> {
    let (w, h) = (frame.width(), frame.height());
    if w <= 2 * margin || h <= 2 * margin {
        return None;
    }
    let area = roi
        .map(|r| r.clipped_to(w, h))
        .unwrap_or(Rect::new(0, 0, w, h));
    let x0 = area.x.max(margin) as i64;
    let y0 = area.y.max(margin) as i64;
    let x1 = area.right().min(w - margin) as i64;
    let y1 = area.bottom().min(h - margin) as i64;

    let mut kernel = Vec::with_capacity(81);
    let mut class_count = [0.0f64; 9];
    for dy in -PSF_REACH..=PSF_REACH {
        for dx in -PSF_REACH..=PSF_REACH {
            let class = ring_class(dx, dy);
            class_count[class] += 1.0;
            kernel.push((dx, dy, class));
        }
    }
    let n = kernel.len() as f64;

    let mut best_fit = 0.0;
    let mut best = None;
    for y in y0..y1 {
        for x in x0..x1 {
            let mut sums = [0.0f64; 9];
            let mut total = 0.0;
            for &(dx, dy, class) in &kernel {
                let v = frame.pixel((x + dx) as u32, (y + dy) as u32) as f64;
                sums[class] += v;
                total += v;
            }
            let mean = total / n;
            let fit: f64 = (0..9)
                .map(|c| PSF_WEIGHTS[c] * (sums[c] - class_count[c] * mean))
                .sum();
            if fit > best_fit {
                best_fit = fit;
                best = Some(Point::new(x as f64, y as f64));
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use nightshade_gear::{SimSky, SimSkyConfig};

    fn star_frame(x: f64, y: f64, peak: f64) -> Frame {
        let sky = SimSky::new(SimSkyConfig {
            star_x: x,
            star_y: y,
            star_peak: peak,
            noise: 0.0,
            ..Default::default()
        });
        let mut frame = Frame::new(200, 160).unwrap();
        sky.render(&mut frame);
        frame
    }

    fn tracker() -> StarTracker {
        StarTracker::new(TrackerConfig::default())
    }

    #[test]
    fn test_locate_centroid() {
        let frame = star_frame(100.3, 80.6, 3000.0);
        let fix = tracker().locate(&frame, Point::new(98.0, 82.0), 15);
        assert_eq!(fix.result, FindResult::Ok);
        assert!(fix.found());
        assert!((fix.position.x - 100.3).abs() < 0.25, "x = {}", fix.position.x);
        assert!((fix.position.y - 80.6).abs() < 0.25, "y = {}", fix.position.y);
        assert!(fix.mass > 10.0);
        assert!(fix.snr > 3.0);
    }

    #[test]
    fn test_near_edge_is_large_motion() {
        let frame = star_frame(10.0, 80.0, 3000.0);
        let prior = Point::new(10.0, 80.0);
        let fix = tracker().locate(&frame, prior, 15);
        assert_eq!(fix.result, FindResult::LargeMotion);
        assert_eq!(fix.position, prior);
        assert!(!fix.found());
    }

    #[test]
    fn test_flat_frame_is_low_mass() {
        let frame = Frame::from_pixels(100, 100, vec![200; 10_000]).unwrap();
        let fix = tracker().locate(&frame, Point::new(50.0, 50.0), 15);
        assert_eq!(fix.result, FindResult::LowMass);
    }

    #[test]
    fn test_gradient_is_low_snr() {
        let mut frame = Frame::from_pixels(100, 100, vec![200; 10_000]).unwrap();
        for y in 0..100 {
            for x in 50..100 {
                frame.set_pixel(x, y, 300);
            }
        }
        let fix = tracker().locate(&frame, Point::new(50.0, 50.0), 15);
        assert_eq!(fix.result, FindResult::LowSnr);
        assert!(fix.snr < 3.0);
    }

    #[test]
    fn test_clipped_star_is_saturated_but_found() {
        let frame = star_frame(100.0, 80.0, 500_000.0);
        let fix = tracker().locate(&frame, Point::new(100.0, 80.0), 15);
        assert_eq!(fix.result, FindResult::Saturated);
        assert!(fix.found());
    }

    #[test]
    fn test_mass_change_rejects_at_most_twice() {
        let bright = star_frame(100.0, 80.0, 3000.0);
        let dim = star_frame(100.0, 80.0, 600.0);
        let prior = Point::new(100.0, 80.0);

        let mut tracker = tracker();
        tracker.set_guiding(true);
        assert_eq!(tracker.locate(&bright, prior, 15).result, FindResult::Ok);
        assert_eq!(tracker.locate(&dim, prior, 15).result, FindResult::MassChange);
        assert_eq!(tracker.locate(&bright, prior, 15).result, FindResult::MassChange);
        assert_eq!(tracker.locate(&dim, prior, 15).result, FindResult::Ok);
    }

    #[test]
    fn test_mass_change_ignored_when_not_guiding() {
        let bright = star_frame(100.0, 80.0, 3000.0);
        let dim = star_frame(100.0, 80.0, 600.0);
        let prior = Point::new(100.0, 80.0);

        let mut tracker = tracker();
        assert!(tracker.locate(&bright, prior, 15).found());
        assert!(tracker.locate(&dim, prior, 15).found());
    }

    #[test]
    fn test_restarting_guiding_resets_rejections() {
        let bright = star_frame(100.0, 80.0, 3000.0);
        let dim = star_frame(100.0, 80.0, 600.0);
        let prior = Point::new(100.0, 80.0);

        let mut tracker = tracker();
        tracker.set_guiding(true);
        tracker.locate(&bright, prior, 15);
        tracker.locate(&dim, prior, 15);
        tracker.set_guiding(false);
        tracker.set_guiding(true);
        // No reference mass after the reset, so the dim frame is accepted
        assert!(tracker.locate(&dim, prior, 15).found());
    }

    #[test]
    fn test_auto_select_finds_star() {
        let frame = star_frame(120.4, 70.2, 3000.0);
        let fix = tracker().auto_select(&frame, None).unwrap();
        assert!(fix.position.distance_to(Point::new(120.4, 70.2)) < 0.5);
    }

    #[test]
    fn test_auto_select_respects_roi() {
        let frame = star_frame(120.0, 70.0, 3000.0);
        let result = tracker().auto_select(&frame, Some(Rect::new(0, 0, 80, 160)));
        assert!(matches!(result, Err(GuideError::NoGuideStar)));
    }

    #[test]
    fn test_auto_select_rejects_subframe() {
        let mut frame = star_frame(120.0, 70.0, 3000.0);
        frame.subframe = Some(Rect::new(90, 40, 60, 60));
        assert!(tracker().auto_select(&frame, None).is_err());
    }

    #[test]
    fn test_ring_class_counts() {
        let mut counts = [0; 9];
        for dy in -4..=4 {
            for dx in -4..=4 {
                counts[ring_class(dx, dy)] += 1;
            }
        }
        assert_eq!(counts, [1, 4, 4, 4, 8, 4, 4, 8, 44]);
    }
}
