//! Guide frame buffer and sensor geometry

use crate::traits::{DeviceError, DeviceResult, NoiseReduction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::{Add, Sub};

/// A position or displacement on the sensor, in pixels
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean length when the point is used as a displacement
    pub fn distance(&self) -> f64 {
        self.x.hypot(self.y)
    }

    pub fn distance_to(&self, other: Point) -> f64 {
        (*self - other).distance()
    }

    /// Angle of the displacement in radians, measured from +x toward +y
    pub fn angle(&self) -> f64 {
        self.y.atan2(self.x)
    }
}

impl Add for Point {
    type Output = Point;

    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Point {
    type Output = Point;

    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

/// Rectangular sensor region (subframe or region of interest)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// One past the last column
    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    /// One past the last row
    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    /// Clip this rectangle to a `width` x `height` sensor.
    pub fn clipped_to(&self, width: u32, height: u32) -> Rect {
        let x = self.x.min(width);
        let y = self.y.min(height);
        Rect::new(x, y, self.right().min(width) - x, self.bottom().min(height) - y)
    }
}

/// Calculate the number of samples in a frame with overflow protection.
///
/// Unchecked `width * height` can wrap on absurd sizes reported by a driver,
/// which would lead to an undersized buffer.
pub fn calculate_buffer_size(width: u32, height: u32) -> DeviceResult<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .ok_or(DeviceError::FrameAllocation { width, height })
}

/// One guide camera exposure
///
/// The pixel buffer always covers the full sensor; `subframe` marks the part
/// that was actually read out.
#[derive(Debug, Clone)]
pub struct Frame {
    width: u32,
    height: u32,
    pixels: Vec<u16>,
    /// Exposure duration in milliseconds
    pub exposure_ms: u32,
    /// When the exposure started
    pub started_at: DateTime<Utc>,
    pub subframe: Option<Rect>,
}

impl Frame {
    /// Allocate a zeroed frame.
    ///
    /// Allocation failure is reported instead of aborting the process.
    pub fn new(width: u32, height: u32) -> DeviceResult<Self> {
        let pixels = allocate(width, height)?;
        Ok(Self {
            width,
            height,
            pixels,
            exposure_ms: 0,
            started_at: Utc::now(),
            subframe: None,
        })
    }

    /// Wrap an existing pixel buffer
    pub fn from_pixels(width: u32, height: u32, pixels: Vec<u16>) -> DeviceResult<Self> {
        let expected = calculate_buffer_size(width, height)?;
        if pixels.len() != expected {
            return Err(DeviceError::CaptureFailed(format!(
                "pixel buffer has {} samples, expected {} for {}x{}",
                pixels.len(),
                expected,
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
            exposure_ms: 0,
            started_at: Utc::now(),
            subframe: None,
        })
    }

    /// Make the buffer fit a `width` x `height` sensor, reusing it when the size matches.
    pub fn resize(&mut self, width: u32, height: u32) -> DeviceResult<()> {
        if self.width != width || self.height != height {
            self.pixels = allocate(width, height)?;
            self.width = width;
            self.height = height;
        }
        Ok(())
    }

    /// Stamp the exposure parameters at the start of a capture
    pub fn begin_exposure(&mut self, duration_ms: u32, subframe: Option<Rect>) {
        self.exposure_ms = duration_ms;
        self.started_at = Utc::now();
        self.subframe = subframe;
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u16] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u16] {
        &mut self.pixels
    }

    /// Sample at (x, y). The caller keeps coordinates inside the frame.
    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> u16 {
        self.pixels[y as usize * self.width as usize + x as usize]
    }

    #[inline]
    pub fn set_pixel(&mut self, x: u32, y: u32, value: u16) {
        let idx = y as usize * self.width as usize + x as usize;
        self.pixels[idx] = value;
    }

    /// Region that holds valid data
    pub fn valid_region(&self) -> Rect {
        match self.subframe {
            Some(sub) => sub.clipped_to(self.width, self.height),
            None => Rect::new(0, 0, self.width, self.height),
        }
    }

    pub fn apply_noise_reduction(&mut self, mode: NoiseReduction) {
        match mode {
            NoiseReduction::None => {}
            NoiseReduction::Mean2x2 => self.mean_2x2(),
            NoiseReduction::Median3x3 => self.median_3x3(),
        }
    }

    fn mean_2x2(&mut self) {
        if self.width < 2 || self.height < 2 {
            return;
        }
        let w = self.width as usize;
        let h = self.height as usize;
        let src = self.pixels.clone();
        for y in 0..h {
            let y1 = (y + 1).min(h - 1);
            for x in 0..w {
                let x1 = (x + 1).min(w - 1);
                let sum = src[y * w + x] as u32
                    + src[y * w + x1] as u32
                    + src[y1 * w + x] as u32
                    + src[y1 * w + x1] as u32;
                self.pixels[y * w + x] = (sum / 4) as u16;
            }
        }
    }

    fn median_3x3(&mut self) {
        if self.width < 3 || self.height < 3 {
            return;
        }
        let w = self.width as usize;
        let h = self.height as usize;
        let src = self.pixels.clone();
        let mut window = [0u16; 9];
        // Border rows and columns keep their original values
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let mut i = 0;
                for yy in y - 1..=y + 1 {
                    for xx in x - 1..=x + 1 {
                        window[i] = src[yy * w + xx];
                        i += 1;
                    }
                }
                window.sort_unstable();
                self.pixels[y * w + x] = window[4];
            }
        }
    }
}

fn allocate(width: u32, height: u32) -> DeviceResult<Vec<u16>> {
    let len = calculate_buffer_size(width, height)?;
    let mut pixels = Vec::new();
    pixels
        .try_reserve_exact(len)
        .map_err(|_| DeviceError::FrameAllocation { width, height })?;
    pixels.resize(len, 0);
    Ok(pixels)
}
