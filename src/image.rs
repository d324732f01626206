//! Image storage and bicubic interpolation with analytic gradients.
//!
//! Intensities are stored as `f64` in a row-major grid. Out-of-range accesses
//! clamp to the border, so interpolated queries stay finite everywhere; a
//! reprojection that drifts outside the image during a trial step simply
//! produces a large residual and the step gets rejected.
//!
//! Interpolation follows the cubic Hermite (Catmull-Rom) convolution used by
//! bicubic image interpolators in direct visual odometry: `evaluate(row, col)`
//! returns the intensity together with its derivatives along row and column.

/// Row-major single-channel image with border-clamped access.
#[derive(Debug, Clone)]
pub struct ImageGrid {
    data: Vec<f64>,
    width: usize,
    height: usize,
}

/// Cubic Hermite interpolation on four consecutive samples.
///
/// Returns the value and derivative at `t ∈ [0, 1]` between `f0` and `f1`.
#[inline]
fn cubic_hermite(fm1: f64, f0: f64, f1: f64, f2: f64, t: f64) -> (f64, f64) {
    let a = -0.5 * fm1 + 1.5 * f0 - 1.5 * f1 + 0.5 * f2;
    let b = fm1 - 2.5 * f0 + 2.0 * f1 - 0.5 * f2;
    let c = 0.5 * (f1 - fm1);
    let d = f0;
    let value = ((a * t + b) * t + c) * t + d;
    let derivative = (3.0 * a * t + 2.0 * b) * t + c;
    (value, derivative)
}

impl ImageGrid {
    /// Wrap a row-major intensity buffer.
    ///
    /// # Panics
    ///
    /// Panics if `data.len() != width * height` or the image is empty.
    pub fn new(data: Vec<f64>, width: usize, height: usize) -> Self {
        assert_eq!(data.len(), width * height, "buffer does not match size");
        assert!(width > 0 && height > 0, "image must be non-empty");
        Self {
            data,
            width,
            height,
        }
    }

    /// Build an image by evaluating `f(row, col)` at every pixel center.
    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> f64) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for row in 0..height {
            for col in 0..width {
                data.push(f(row, col));
            }
        }
        Self::new(data, width, height)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Pixel value with border clamping.
    #[inline]
    pub fn at(&self, row: i64, col: i64) -> f64 {
        let r = row.clamp(0, self.height as i64 - 1) as usize;
        let c = col.clamp(0, self.width as i64 - 1) as usize;
        self.data[r * self.width + c]
    }

    /// Bicubic intensity and gradient at a subpixel location.
    ///
    /// Returns `(value, d/drow, d/dcol)`.
    pub fn evaluate(&self, row: f64, col: f64) -> (f64, f64, f64) {
        let row0 = row.floor();
        let col0 = col.floor();
        let tr = row - row0;
        let tc = col - col0;
        let (ir, ic) = (row0 as i64, col0 as i64);

        // Interpolate along columns in each of the four support rows,
        // collecting values and column derivatives.
        let mut vals = [0.0; 4];
        let mut dcols = [0.0; 4];
        for (k, dr) in (-1i64..=2).enumerate() {
            let r = ir + dr;
            let (v, d) = cubic_hermite(
                self.at(r, ic - 1),
                self.at(r, ic),
                self.at(r, ic + 1),
                self.at(r, ic + 2),
                tc,
            );
            vals[k] = v;
            dcols[k] = d;
        }

        // Interpolate the row direction: values give f and df/drow, the
        // column derivatives give df/dcol.
        let (value, drow) = cubic_hermite(vals[0], vals[1], vals[2], vals[3], tr);
        let (dcol, _) = cubic_hermite(dcols[0], dcols[1], dcols[2], dcols[3], tr);
        (value, drow, dcol)
    }

    /// Bicubic intensity only.
    #[inline]
    pub fn sample(&self, row: f64, col: f64) -> f64 {
        self.evaluate(row, col).0
    }

    /// 2x decimated copy (plain 2x2 averaging).
    fn decimate(&self) -> ImageGrid {
        let width = (self.width / 2).max(1);
        let height = (self.height / 2).max(1);
        ImageGrid::from_fn(width, height, |row, col| {
            let (r, c) = (2 * row as i64, 2 * col as i64);
            0.25 * (self.at(r, c) + self.at(r, c + 1) + self.at(r + 1, c) + self.at(r + 1, c + 1))
        })
    }
}

/// Multi-resolution stack of an image; level 0 is the finest.
///
/// The bundle adjuster reads level 0 only; coarser levels serve the
/// frame-to-frame tracker that runs outside this crate.
#[derive(Debug, Clone)]
pub struct ImagePyramid {
    levels: Vec<ImageGrid>,
}

impl ImagePyramid {
    /// Build a pyramid with `num_levels` levels by repeated 2x decimation.
    pub fn new(base: ImageGrid, num_levels: usize) -> Self {
        assert!(num_levels >= 1, "pyramid needs at least one level");
        let mut levels = Vec::with_capacity(num_levels);
        let mut current = base;
        for _ in 1..num_levels {
            let next = current.decimate();
            levels.push(current);
            current = next;
        }
        levels.push(current);
        Self { levels }
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Grid at the given level; level 0 is the input resolution.
    pub fn level(&self, level: usize) -> &ImageGrid {
        &self.levels[level]
    }
}
