// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 透视标定模块
//! Planar perspective calibration between image pixels and world coordinates.
//!
//! A homography is fitted from four or more point correspondences. Exactly four
//! points give an exact fit; more points give the least-squares fit. Points are
//! normalised (centroid to origin, mean distance √2) before solving so that
//! pixel-scale coordinates do not wreck the conditioning of the normal equations.

use ndarray::Array2;

use crate::error::CalibrationError;

/// 二维点 [x, y]
pub type Point = [f32; 2];

/// 3x3 透视变换矩阵 (row-major)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography {
    pub m: [[f64; 3]; 3],
}

impl Homography {
    pub fn identity() -> Self {
        Self {
            m: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        }
    }

    /// 相似变换 (均匀缩放 + 平移)
    fn similarity(scale: f64, tx: f64, ty: f64) -> Self {
        Self {
            m: [[scale, 0.0, tx], [0.0, scale, ty], [0.0, 0.0, 1.0]],
        }
    }

    /// 应用透视变换到点 (x, y); 点落在地平线上时返回 None
    pub fn transform_point(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let m = &self.m;
        let w = m[2][0] * x + m[2][1] * y + m[2][2];
        if w.abs() < 1e-12 {
            return None;
        }
        let px = (m[0][0] * x + m[0][1] * y + m[0][2]) / w;
        let py = (m[1][0] * x + m[1][1] * y + m[1][2]) / w;
        Some((px, py))
    }

    /// 矩阵组合 (self * other)
    pub fn compose(&self, other: &Self) -> Self {
        let mut out = [[0.0f64; 3]; 3];
        for (i, row) in out.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = (0..3).map(|k| self.m[i][k] * other.m[k][j]).sum();
            }
        }
        Self { m: out }
    }

    /// 计算逆矩阵 (伴随矩阵法)
    pub fn inverse(&self) -> Option<Self> {
        let m = &self.m;
        let cof = |r0: usize, r1: usize, c0: usize, c1: usize| {
            m[r0][c0] * m[r1][c1] - m[r0][c1] * m[r1][c0]
        };

        let det = m[0][0] * cof(1, 2, 1, 2) - m[0][1] * cof(1, 2, 0, 2) + m[0][2] * cof(1, 2, 0, 1);
        if det.abs() < 1e-12 {
            return None;
        }
        let inv_det = 1.0 / det;

        let adj = [
            [cof(1, 2, 1, 2), -cof(0, 2, 1, 2), cof(0, 1, 1, 2)],
            [-cof(1, 2, 0, 2), cof(0, 2, 0, 2), -cof(0, 1, 0, 2)],
            [cof(1, 2, 0, 1), -cof(0, 2, 0, 1), cof(0, 1, 0, 1)],
        ];

        let mut out = [[0.0f64; 3]; 3];
        for i in 0..3 {
            for j in 0..3 {
                out[i][j] = adj[i][j] * inv_det;
            }
        }
        Some(Self { m: out })
    }

    /// 从点对拟合透视矩阵 (≥4 对, 4 对时精确解, 多于 4 对时最小二乘解)
    pub fn fit(src: &[Point], dst: &[Point]) -> Result<Self, CalibrationError> {
        validate_pairs(src, dst)?;

        let (t_src, src_n) = normalize(src)?;
        let (t_dst, dst_n) = normalize(dst)?;

        // 每对点贡献两行:
        // [x y 1 0 0 0 -x*u -y*u] h = u
        // [0 0 0 x y 1 -x*v -y*v] h = v
        let rows = src.len() * 2;
        let mut a = Array2::<f64>::zeros((rows, 8));
        let mut b = Array2::<f64>::zeros((rows, 1));
        for (i, (&(x, y), &(u, v))) in src_n.iter().zip(dst_n.iter()).enumerate() {
            let r = i * 2;
            a[[r, 0]] = x;
            a[[r, 1]] = y;
            a[[r, 2]] = 1.0;
            a[[r, 6]] = -x * u;
            a[[r, 7]] = -y * u;
            b[[r, 0]] = u;

            a[[r + 1, 3]] = x;
            a[[r + 1, 4]] = y;
            a[[r + 1, 5]] = 1.0;
            a[[r + 1, 6]] = -x * v;
            a[[r + 1, 7]] = -y * v;
            b[[r + 1, 0]] = v;
        }

        // 正规方程 AᵀA h = Aᵀb (4 点时与精确解一致)
        let at = a.t();
        let ata = at.dot(&a);
        let atb = at.dot(&b);

        let h = solve_linear_system(&ata, &atb).ok_or(CalibrationError::Degenerate)?;
        let normalized = Self {
            m: [[h[0], h[1], h[2]], [h[3], h[4], h[5]], [h[6], h[7], 1.0]],
        };

        let t_dst_inv = t_dst.inverse().ok_or(CalibrationError::Degenerate)?;
        let full = t_dst_inv.compose(&normalized.compose(&t_src));

        // 统一尺度, 使 m[2][2] = 1
        let s = full.m[2][2];
        if s.abs() < 1e-12 {
            return Err(CalibrationError::Degenerate);
        }
        let mut m = full.m;
        for row in m.iter_mut() {
            for cell in row.iter_mut() {
                *cell /= s;
            }
        }
        Ok(Self { m })
    }
}

fn validate_pairs(src: &[Point], dst: &[Point]) -> Result<(), CalibrationError> {
    if src.len() != dst.len() {
        return Err(CalibrationError::InvalidCalibration(format!(
            "image/world point counts differ ({} vs {})",
            src.len(),
            dst.len()
        )));
    }
    if src.len() < 4 {
        return Err(CalibrationError::InvalidCalibration(format!(
            "need at least 4 point pairs, got {}",
            src.len()
        )));
    }
    if src.iter().chain(dst.iter()).any(|p| !p[0].is_finite() || !p[1].is_finite()) {
        return Err(CalibrationError::InvalidCalibration(
            "non-finite coordinate".to_string(),
        ));
    }
    Ok(())
}

/// Hartley 归一化: 返回 (归一化变换, 变换后的点)
fn normalize(points: &[Point]) -> Result<(Homography, Vec<(f64, f64)>), CalibrationError> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p[0] as f64).sum::<f64>() / n;
    let cy = points.iter().map(|p| p[1] as f64).sum::<f64>() / n;

    let mean_dist = points
        .iter()
        .map(|p| ((p[0] as f64 - cx).powi(2) + (p[1] as f64 - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if mean_dist < 1e-12 {
        return Err(CalibrationError::Degenerate);
    }

    let scale = std::f64::consts::SQRT_2 / mean_dist;
    let t = Homography::similarity(scale, -scale * cx, -scale * cy);
    let out = points
        .iter()
        .map(|p| ((p[0] as f64 - cx) * scale, (p[1] as f64 - cy) * scale))
        .collect();
    Ok((t, out))
}

/// 高斯消元 (部分主元) 求解 n×n 线性方程组
fn solve_linear_system(a: &Array2<f64>, b: &Array2<f64>) -> Option<Vec<f64>> {
    let n = a.nrows();
    let mut matrix = Array2::<f64>::zeros((n, n + 1));
    for i in 0..n {
        for j in 0..n {
            matrix[[i, j]] = a[[i, j]];
        }
        matrix[[i, n]] = b[[i, 0]];
    }

    for i in 0..n {
        // 找到主元
        let mut max_row = i;
        for j in (i + 1)..n {
            if matrix[[j, i]].abs() > matrix[[max_row, i]].abs() {
                max_row = j;
            }
        }

        // 交换行
        if max_row != i {
            for k in 0..=n {
                matrix.swap([i, k], [max_row, k]);
            }
        }

        // 检查奇异性
        if matrix[[i, i]].abs() < 1e-10 {
            return None;
        }

        // 消元
        for j in (i + 1)..n {
            let factor = matrix[[j, i]] / matrix[[i, i]];
            for k in i..=n {
                matrix[[j, k]] -= factor * matrix[[i, k]];
            }
        }
    }

    // 回代求解
    let mut x = vec![0.0f64; n];
    for i in (0..n).rev() {
        x[i] = matrix[[i, n]];
        for j in (i + 1)..n {
            x[i] -= matrix[[i, j]] * x[j];
        }
        x[i] /= matrix[[i, i]];
    }
    Some(x)
}

/// 标定结果 (图像 ↔ 世界), 计算后不可变
#[derive(Debug, Clone, Copy)]
pub struct CalibrationTransform {
    to_world: Homography,
    to_image: Homography,
}

impl CalibrationTransform {
    pub fn fit(image_pts: &[Point], world_pts: &[Point]) -> Result<Self, CalibrationError> {
        let to_world = Homography::fit(image_pts, world_pts)?;
        let to_image = to_world.inverse().ok_or(CalibrationError::Degenerate)?;
        Ok(Self { to_world, to_image })
    }

    pub fn to_world(&self, p: Point) -> Result<Point, CalibrationError> {
        apply(&self.to_world, p)
    }

    pub fn to_image(&self, p: Point) -> Result<Point, CalibrationError> {
        apply(&self.to_image, p)
    }
}

fn apply(h: &Homography, p: Point) -> Result<Point, CalibrationError> {
    h.transform_point(p[0] as f64, p[1] as f64)
        .map(|(x, y)| [x as f32, y as f32])
        .ok_or(CalibrationError::Degenerate)
}

/// 几何标定器 (每路视频流一个)
#[derive(Debug, Clone, Default)]
pub struct Calibrator {
    transform: Option<CalibrationTransform>,
}

impl Calibrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 由四对及以上点计算标定; 失败时保持原状态
    pub fn calibrate(
        &mut self,
        image_pts: &[Point],
        world_pts: &[Point],
    ) -> Result<CalibrationTransform, CalibrationError> {
        let transform = CalibrationTransform::fit(image_pts, world_pts)?;
        self.transform = Some(transform);
        Ok(transform)
    }

    pub fn is_calibrated(&self) -> bool {
        self.transform.is_some()
    }

    pub fn transform(&self) -> Result<&CalibrationTransform, CalibrationError> {
        self.transform.as_ref().ok_or(CalibrationError::NotCalibrated)
    }

    pub fn map_to_world(&self, points: &[Point]) -> Result<Vec<Point>, CalibrationError> {
        let t = self.transform()?;
        points.iter().map(|&p| t.to_world(p)).collect()
    }

    pub fn map_to_image(&self, points: &[Point]) -> Result<Vec<Point>, CalibrationError> {
        let t = self.transform()?;
        points.iter().map(|&p| t.to_image(p)).collect()
    }
}
