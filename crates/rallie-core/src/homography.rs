//! Image-to-court homography.
//!
//! The operator taps four court corners in the camera image. From those the
//! engine derives four more references (service line ends, T-point and
//! net-center), fits a 3×3 projective transform with the Direct Linear
//! Transform and refines it with RANSAC. Projection maps detections into
//! court meters and softly clamps them to the court surroundings.

use std::sync::{Arc, PoisonError, RwLock};

use nalgebra::{DMatrix, Matrix3, SymmetricEigen, Vector3};
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{cross2, CourtConfig, CourtPoint, FloatType, PixelPoint};

/// Correspondences needed for a fit.
pub const MIN_CORRESPONDENCES: usize = 4;
/// Correspondences after tap derivation.
pub const FULL_CORRESPONDENCES: usize = 8;

pub const RANSAC_ITERATIONS: usize = 200;
/// Court-space reprojection error below which a correspondence is an inlier.
pub const RANSAC_INLIER_THRESHOLD_M: FloatType = 0.25;
const RANSAC_SEED: u64 = 0x5AA5;

/// Twice the triangle area, in Hartley-normalized units, below which three
/// points count as collinear.
const COLLINEAR_TOLERANCE: FloatType = 1e-3;
/// Determinant of the unit-norm normalized transform below which it is
/// treated as singular.
const SINGULAR_TOLERANCE: FloatType = 1e-9;
/// Smallest homogeneous `w` accepted during projection.
const MIN_HOMOGENEOUS_W: FloatType = 1e-9;

/// How far a projected point may stray beyond the sidelines.
pub const SIDELINE_TOLERANCE_M: FloatType = 1.0;
/// How far a projected point may stray beyond the net.
pub const NET_TOLERANCE_M: FloatType = 1.0;
/// How far a projected point may stray beyond the baseline. Foot detections
/// overshoot the far edge often, hence the wider band.
pub const BASELINE_TOLERANCE_M: FloatType = 3.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("expected 4 or 8 correspondences, got {actual}")]
    WrongCorrespondenceCount { actual: usize },
    #[error("too few points: need {needed}, got {got}")]
    TooFewPoints { needed: usize, got: usize },
    #[error("degenerate point configuration: {0}")]
    Degenerate(&'static str),
    #[error("numerical failure: {0}")]
    NumericalFailure(String),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionError {
    #[error("no homography calibrated")]
    NotCalibrated,
    #[error("point maps to infinity under the current homography")]
    DegenerateTransform,
}

/// An image point and the court point it shows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Correspondence {
    pub image: PixelPoint,
    pub court: CourtPoint,
}

/// Ordered correspondences ready for fitting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSet {
    correspondences: Vec<Correspondence>,
}

impl CalibrationSet {
    pub fn new(correspondences: Vec<Correspondence>) -> Result<Self, CalibrationError> {
        let actual = correspondences.len();
        if actual < MIN_CORRESPONDENCES {
            return Err(CalibrationError::TooFewPoints {
                needed: MIN_CORRESPONDENCES,
                got: actual,
            });
        }
        if actual != MIN_CORRESPONDENCES && actual != FULL_CORRESPONDENCES {
            return Err(CalibrationError::WrongCorrespondenceCount { actual });
        }
        Ok(Self { correspondences })
    }

    /// The four tapped corners paired with the court corners.
    pub fn from_taps(taps: &[PixelPoint; 4], court: &CourtConfig) -> Self {
        let correspondences = taps
            .iter()
            .zip(court.tap_corners())
            .map(|(image, court)| Correspondence {
                image: *image,
                court,
            })
            .collect();
        Self { correspondences }
    }

    pub fn correspondences(&self) -> &[Correspondence] {
        &self.correspondences
    }

    pub fn len(&self) -> usize {
        self.correspondences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.correspondences.is_empty()
    }

    fn image_points(&self) -> Vec<[FloatType; 2]> {
        self.correspondences.iter().map(|c| c.image.as_array()).collect()
    }

    fn court_points(&self) -> Vec<[FloatType; 2]> {
        self.correspondences.iter().map(|c| c.court.as_array()).collect()
    }
}

/// Image-to-court transform, scaled so that `h22 = 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct HomographyMatrix(Matrix3<FloatType>);

impl HomographyMatrix {
    pub fn new(m: Matrix3<FloatType>) -> Self {
        Self(m)
    }

    pub fn matrix(&self) -> &Matrix3<FloatType> {
        &self.0
    }

    pub fn project(&self, image: PixelPoint) -> Result<CourtPoint, ProjectionError> {
        apply(&self.0, &image.as_array()).map(CourtPoint::from)
    }

    /// Map a court point back into the image.
    pub fn unproject(&self, court: CourtPoint) -> Result<PixelPoint, ProjectionError> {
        let inv = self
            .0
            .try_inverse()
            .ok_or(ProjectionError::DegenerateTransform)?;
        apply(&inv, &court.as_array()).map(PixelPoint::from)
    }

    /// Mean court-space distance between projected image points and their
    /// court references.
    pub fn mean_residual(&self, set: &CalibrationSet) -> Result<FloatType, ProjectionError> {
        let mut total = 0.0;
        for c in set.correspondences() {
            total += self.project(c.image)?.distance(&c.court);
        }
        Ok(total / set.len() as FloatType)
    }
}

fn apply(h: &Matrix3<FloatType>, p: &[FloatType; 2]) -> Result<[FloatType; 2], ProjectionError> {
    let q = h * Vector3::new(p[0], p[1], 1.0);
    if !(q[2].abs() >= MIN_HOMOGENEOUS_W) {
        return Err(ProjectionError::DegenerateTransform);
    }
    let out = [q[0] / q[2], q[1] / q[2]];
    if out[0].is_finite() && out[1].is_finite() {
        Ok(out)
    } else {
        Err(ProjectionError::DegenerateTransform)
    }
}

fn reprojection_error(h: &Matrix3<FloatType>, src: &[FloatType; 2], dst: &[FloatType; 2]) -> FloatType {
    match apply(h, src) {
        Ok(p) => ((p[0] - dst[0]).powi(2) + (p[1] - dst[1]).powi(2)).sqrt(),
        Err(_) => FloatType::INFINITY,
    }
}

/// Translate the centroid to the origin and scale so the mean distance from
/// it is √2.
fn normalize_points(pts: &[[FloatType; 2]]) -> (Matrix3<FloatType>, Vec<[FloatType; 2]>) {
    let n = pts.len() as FloatType;
    let cx = pts.iter().map(|p| p[0]).sum::<FloatType>() / n;
    let cy = pts.iter().map(|p| p[1]).sum::<FloatType>() / n;
    let mean_dist = pts
        .iter()
        .map(|p| ((p[0] - cx).powi(2) + (p[1] - cy).powi(2)).sqrt())
        .sum::<FloatType>()
        / n;
    let s = if mean_dist > 1e-15 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let normalized = pts.iter().map(|p| [s * (p[0] - cx), s * (p[1] - cy)]).collect();
    (t, normalized)
}

fn triples(n: usize) -> impl Iterator<Item = (usize, usize, usize)> {
    (0..n).flat_map(move |i| ((i + 1)..n).flat_map(move |j| ((j + 1)..n).map(move |k| (i, j, k))))
}

fn collinear(p: &[[FloatType; 2]], (i, j, k): (usize, usize, usize)) -> bool {
    cross2(&p[i], &p[j], &p[k]).abs() < COLLINEAR_TOLERANCE
}

fn has_collinear_triple(pts: &[[FloatType; 2]]) -> bool {
    let (_, normalized) = normalize_points(pts);
    triples(normalized.len()).any(|t| collinear(&normalized, t))
}

fn all_collinear(pts: &[[FloatType; 2]]) -> bool {
    let (_, normalized) = normalize_points(pts);
    triples(normalized.len()).all(|t| collinear(&normalized, t))
}

fn check_configuration(pts: &[[FloatType; 2]]) -> Result<(), CalibrationError> {
    if all_collinear(pts) {
        return Err(CalibrationError::Degenerate("all points collinear"));
    }
    if pts.len() == MIN_CORRESPONDENCES && has_collinear_triple(pts) {
        return Err(CalibrationError::Degenerate("three of four points collinear"));
    }
    Ok(())
}

/// Estimate `H` with `dst ≈ H·src` from at least four correspondences.
fn estimate_dlt(
    src: &[[FloatType; 2]],
    dst: &[[FloatType; 2]],
) -> Result<Matrix3<FloatType>, CalibrationError> {
    let n = src.len().min(dst.len());
    if n < MIN_CORRESPONDENCES {
        return Err(CalibrationError::TooFewPoints {
            needed: MIN_CORRESPONDENCES,
            got: n,
        });
    }
    if src.len() != dst.len() {
        return Err(CalibrationError::NumericalFailure(
            "point lists differ in length".into(),
        ));
    }

    let (t_src, src_n) = normalize_points(src);
    let (t_dst, dst_n) = normalize_points(dst);

    let mut a = DMatrix::<FloatType>::zeros(2 * n, 9);
    for i in 0..n {
        let (sx, sy) = (src_n[i][0], src_n[i][1]);
        let (dx, dy) = (dst_n[i][0], dst_n[i][1]);

        a[(2 * i, 3)] = -sx;
        a[(2 * i, 4)] = -sy;
        a[(2 * i, 5)] = -1.0;
        a[(2 * i, 6)] = dy * sx;
        a[(2 * i, 7)] = dy * sy;
        a[(2 * i, 8)] = dy;

        a[(2 * i + 1, 0)] = sx;
        a[(2 * i + 1, 1)] = sy;
        a[(2 * i + 1, 2)] = 1.0;
        a[(2 * i + 1, 6)] = -dx * sx;
        a[(2 * i + 1, 7)] = -dx * sy;
        a[(2 * i + 1, 8)] = -dx;
    }

    // Null vector of A is the eigenvector of AᵀA with the smallest eigenvalue.
    let ata = a.transpose() * &a;
    let eig = SymmetricEigen::new(ata);
    let min_idx = eig
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|(_, x), (_, y)| x.abs().total_cmp(&y.abs()))
        .map(|(i, _)| i)
        .ok_or_else(|| CalibrationError::NumericalFailure("empty eigen decomposition".into()))?;
    let h = eig.eigenvectors.column(min_idx);
    let h_norm = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    if !(h_norm.determinant().abs() >= SINGULAR_TOLERANCE) {
        return Err(CalibrationError::Degenerate("near-singular transform"));
    }

    let t_dst_inv = t_dst
        .try_inverse()
        .ok_or_else(|| CalibrationError::NumericalFailure("normalization not invertible".into()))?;
    let h = t_dst_inv * h_norm * t_src;

    let scale = h[(2, 2)];
    if scale.abs() < 1e-15 {
        return Err(CalibrationError::NumericalFailure(
            "transform maps the origin to infinity".into(),
        ));
    }
    Ok(h / scale)
}

fn estimate_ransac(
    src: &[[FloatType; 2]],
    dst: &[[FloatType; 2]],
) -> Result<Matrix3<FloatType>, CalibrationError> {
    let n = src.len();
    let mut rng = StdRng::seed_from_u64(RANSAC_SEED);
    let mut best: Option<(usize, Vec<bool>)> = None;

    for _ in 0..RANSAC_ITERATIONS {
        let sample = rand::seq::index::sample(&mut rng, n, MIN_CORRESPONDENCES).into_vec();
        let s: Vec<_> = sample.iter().map(|&i| src[i]).collect();
        let d: Vec<_> = sample.iter().map(|&i| dst[i]).collect();
        if has_collinear_triple(&s) || has_collinear_triple(&d) {
            continue;
        }
        let Ok(h) = estimate_dlt(&s, &d) else {
            continue;
        };
        let mask: Vec<bool> = src
            .iter()
            .zip(dst)
            .map(|(s, d)| reprojection_error(&h, s, d) < RANSAC_INLIER_THRESHOLD_M)
            .collect();
        let count = mask.iter().filter(|m| **m).count();
        if best.as_ref().map_or(true, |(best_count, _)| count > *best_count) {
            best = Some((count, mask));
            if count == n {
                break;
            }
        }
    }

    match best {
        Some((count, mask)) if count >= MIN_CORRESPONDENCES => {
            if count < n {
                warn!("calibration: {} of {n} correspondences rejected as outliers", n - count);
            }
            let (s, d): (Vec<_>, Vec<_>) = src
                .iter()
                .zip(dst)
                .zip(&mask)
                .filter(|(_, keep)| **keep)
                .map(|((s, d), _)| (*s, *d))
                .unzip();
            estimate_dlt(&s, &d).or_else(|e| {
                debug!("inlier refit failed ({e}), fitting all correspondences");
                estimate_dlt(src, dst)
            })
        }
        _ => {
            debug!("no consensus set found, fitting all {n} correspondences");
            estimate_dlt(src, dst)
        }
    }
}

/// Fit an image-to-court homography.
pub fn fit(set: &CalibrationSet) -> Result<HomographyMatrix, CalibrationError> {
    let image = set.image_points();
    let court = set.court_points();
    check_configuration(&image)?;
    check_configuration(&court)?;
    let h = if set.len() == MIN_CORRESPONDENCES {
        estimate_dlt(&image, &court)?
    } else {
        estimate_ransac(&image, &court)?
    };
    Ok(HomographyMatrix(h))
}

/// Clamp a projected point to the court plus its tolerance bands.
pub fn correct_to_bounds(p: CourtPoint, court: &CourtConfig) -> CourtPoint {
    CourtPoint {
        x: p.x.clamp(-SIDELINE_TOLERANCE_M, court.width + SIDELINE_TOLERANCE_M),
        y: p.y.clamp(-NET_TOLERANCE_M, court.length + BASELINE_TOLERANCE_M),
    }
}

/// A successful calibration.
#[derive(Debug, Clone)]
pub struct Calibration {
    pub set: CalibrationSet,
    pub matrix: Arc<HomographyMatrix>,
    /// Mean reprojection residual over `set`, in meters.
    pub residual_m: FloatType,
}

/// Holds the current homography. Recalibration replaces it wholesale, so a
/// reader holding an `Arc` from [`Self::matrix`] keeps a consistent matrix.
pub struct HomographyEngine {
    court: CourtConfig,
    current: RwLock<Option<Arc<HomographyMatrix>>>,
}

impl HomographyEngine {
    pub fn new(court: CourtConfig) -> Self {
        Self {
            court,
            current: RwLock::new(None),
        }
    }

    pub fn court(&self) -> &CourtConfig {
        &self.court
    }

    pub fn matrix(&self) -> Option<Arc<HomographyMatrix>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_calibrated(&self) -> bool {
        self.matrix().is_some()
    }

    /// Fit and install a homography. On failure the previous one stays.
    pub fn calibrate(&self, set: CalibrationSet) -> Result<Calibration, CalibrationError> {
        let result = fit(&set).and_then(|matrix| {
            let residual_m = matrix
                .mean_residual(&set)
                .map_err(|e| CalibrationError::NumericalFailure(e.to_string()))?;
            Ok((matrix, residual_m))
        });
        let (matrix, residual_m) = match result {
            Ok(ok) => ok,
            Err(e) => {
                warn!("calibration with {} correspondences failed: {e}", set.len());
                return Err(e);
            }
        };
        let matrix = Arc::new(matrix);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(matrix.clone());
        info!(
            "calibrated from {} correspondences, mean residual {:.4} m",
            set.len(),
            residual_m
        );
        Ok(Calibration {
            set,
            matrix,
            residual_m,
        })
    }

    /// Calibrate from the four tapped corners, deriving the remaining
    /// references through a provisional fit.
    pub fn calibrate_from_taps(&self, taps: [PixelPoint; 4]) -> Result<Calibration, CalibrationError> {
        let base = CalibrationSet::from_taps(&taps, &self.court);
        let provisional = fit(&base).map_err(|e| {
            warn!("tapped corners rejected: {e}");
            e
        })?;
        let mut correspondences = base.correspondences;
        for court in self.court.derived_references() {
            let image = provisional
                .unproject(court)
                .map_err(|e| CalibrationError::NumericalFailure(e.to_string()))?;
            debug!("derived reference {court:?} at image {image:?}");
            correspondences.push(Correspondence { image, court });
        }
        self.calibrate(CalibrationSet::new(correspondences)?)
    }

    /// Raw projection of an image point into court meters.
    pub fn project(&self, image: PixelPoint) -> Result<CourtPoint, ProjectionError> {
        let matrix = self.matrix().ok_or(ProjectionError::NotCalibrated)?;
        matrix.project(image)
    }

    /// Projection followed by [`correct_to_bounds`]. Points outside the
    /// calibrated area are kept, not rejected.
    pub fn project_corrected(&self, image: PixelPoint) -> Result<CourtPoint, ProjectionError> {
        Ok(correct_to_bounds(self.project(image)?, &self.court))
    }
}
